use std::fs::OpenOptions;
use std::io::{BufReader, BufWriter, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Error};

use dirstream::{format_single_line_entry, Decoder, OverwriteFlags, UnarchiveOptions};

use proxmox_router::cli::*;
use proxmox_schema::api;

fn extract_archive_from_reader<R: Read>(
    reader: R,
    target: &str,
    options: UnarchiveOptions,
) -> Result<(), Error> {
    dirstream::extract_archive(reader, Path::new(target), options, |path| {
        log::debug!("{:?}", path);
    })
}

fn open_archive(archive: &str) -> Result<Box<dyn Read>, Error> {
    if archive == "-" {
        return Ok(Box::new(std::io::stdin().lock()));
    }

    log::debug!("opening archive {archive}");
    let file = std::fs::File::open(archive)
        .map_err(|err| format_err!("unable to open archive {archive:?} - {err}"))?;
    Ok(Box::new(BufReader::new(file)))
}

#[api(
    input: {
        properties: {
            archive: {
                description: "Archive name, '-' reads the stream from stdin.",
            },
            target: {
                description: "Target directory",
                optional: true,
            },
            "allow-existing-dirs": {
                description: "Allows directories to already exist on restore.",
                optional: true,
                default: false,
            },
            "overwrite": {
                description: "overwrite already existing files, symlinks and hardlinks",
                optional: true,
                default: false,
            },
            "overwrite-files": {
                description: "overwrite already existing files",
                optional: true,
                default: false,
            },
            "overwrite-symlinks": {
                description: "overwrite already existing entries by archives symlink",
                optional: true,
                default: false,
            },
            "overwrite-hardlinks": {
                description: "overwrite already existing entries by archives hardlink",
                optional: true,
                default: false,
            },
        },
    },
)]
/// Extract an archive.
fn extract_archive(
    archive: String,
    target: Option<String>,
    allow_existing_dirs: bool,
    overwrite: bool,
    overwrite_files: bool,
    overwrite_symlinks: bool,
    overwrite_hardlinks: bool,
) -> Result<(), Error> {
    let mut overwrite_flags = OverwriteFlags::empty();
    overwrite_flags.set(OverwriteFlags::FILE, overwrite_files);
    overwrite_flags.set(OverwriteFlags::SYMLINK, overwrite_symlinks);
    overwrite_flags.set(OverwriteFlags::HARDLINK, overwrite_hardlinks);
    if overwrite {
        overwrite_flags.insert(OverwriteFlags::all());
    }

    let target = target.as_ref().map_or_else(|| ".", String::as_str);

    let options = UnarchiveOptions {
        allow_existing_dirs,
        overwrite_flags,
    };

    let reader = open_archive(&archive)?;
    extract_archive_from_reader(reader, target, options)
}

#[api(
    input: {
        properties: {
            archive: {
                description: "Archive name, '-' writes the stream to stdout.",
            },
            source: {
                description: "Source directory.",
            },
        },
    },
)]
/// Create a new archive.
fn create_archive(archive: String, source: String) -> Result<(), Error> {
    let source = PathBuf::from(source);

    let callback = |path: &Path| -> Result<(), Error> {
        log::debug!("{:?}", path);
        Ok(())
    };

    if archive == "-" {
        let stdout = std::io::stdout();
        let mut writer = BufWriter::with_capacity(1024 * 1024, stdout.lock());
        dirstream::create_archive(&source, &mut writer, callback)?;
        writer.flush()?;
        return Ok(());
    }

    let file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(0o640)
        .open(&archive)
        .with_context(|| format!("unable to create archive {archive:?}"))?;

    let mut writer = BufWriter::with_capacity(1024 * 1024, file);
    dirstream::create_archive(&source, &mut writer, callback)?;
    writer.flush()?;

    Ok(())
}

#[api(
    input: {
        properties: {
            archive: {
                description: "Archive name, '-' reads the stream from stdin.",
            },
        },
    },
)]
/// List the contents of an archive.
fn dump_archive(archive: String) -> Result<(), Error> {
    for entry in Decoder::new(open_archive(&archive)?) {
        let entry = entry?;

        if log::log_enabled!(log::Level::Debug) {
            log::debug!("{}", format_single_line_entry(&entry));
        } else {
            log::info!("{:?}", entry.path());
        }
    }
    Ok(())
}

#[api(
    input: {
        properties: {
            source: {
                description: "Source directory.",
            },
        },
    },
)]
/// Print the SHA-256 digest and size of the archive stream of a directory.
fn digest(source: String) -> Result<(), Error> {
    let (csum, size) = dirstream::tree_digest(Path::new(&source))?;
    println!("{}  {}", hex::encode(csum), size);
    Ok(())
}

fn main() {
    init_cli_logger("DIRSTREAM_LOG", "info");

    let cmd_def = CliCommandMap::new()
        .insert(
            "create",
            CliCommand::new(&API_METHOD_CREATE_ARCHIVE)
                .arg_param(&["archive", "source"])
                .completion_cb("archive", complete_file_name)
                .completion_cb("source", complete_file_name),
        )
        .insert(
            "extract",
            CliCommand::new(&API_METHOD_EXTRACT_ARCHIVE)
                .arg_param(&["archive", "target"])
                .completion_cb("archive", complete_file_name)
                .completion_cb("target", complete_file_name),
        )
        .insert(
            "list",
            CliCommand::new(&API_METHOD_DUMP_ARCHIVE)
                .arg_param(&["archive"])
                .completion_cb("archive", complete_file_name),
        )
        .insert(
            "digest",
            CliCommand::new(&API_METHOD_DIGEST)
                .arg_param(&["source"])
                .completion_cb("source", complete_file_name),
        );

    let rpcenv = CliEnvironment::new();
    run_cli_command(
        cmd_def,
        rpcenv,
        Some(|future| proxmox_async::runtime::main(future)),
    );
}
