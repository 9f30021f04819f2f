use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::process::exit;

/// Where the merged database lands
const DEFAULT_DB_FILE_NAME: &str = "sshenum.db";

/// Builds a fingerprint database for sshenum's -F option.
///
/// Every `<osname>.lst` file in the given directory is read as one username
/// per line; the output maps each username to every OS list it appeared in,
/// `user;os1;os2` per line.
fn main() {
    let mut args = env::args();
    let progname = args.next().unwrap_or_else(|| "createdb".to_string());
    let Some(dir) = args.next() else {
        usage(&progname);
        exit(1);
    };

    let mut database: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    let entries = match Path::new(&dir).read_dir() {
        Ok(entries) => entries,
        Err(err) => {
            eprintln!("{dir}: {err}");
            usage(&progname);
            exit(1);
        }
    };

    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            eprintln!("Not a regular file: skipping {}", path.display());
            continue;
        }
        let osname = match (path.extension(), path.file_stem()) {
            (Some(ext), Some(stem)) if ext == "lst" => stem.to_string_lossy().to_string(),
            _ => {
                eprintln!("Not a .lst file: skipping {}", path.display());
                continue;
            }
        };
        eprintln!("Reading: {} Osname: {osname}", path.display());

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                eprintln!("{}: {err}", path.display());
                exit(1);
            }
        };
        for line in BufReader::new(file).lines() {
            let Ok(user) = line else { break };
            if user.is_empty() {
                continue;
            }
            database.entry(user).or_default().insert(osname.clone());
        }
    }

    let out = match File::create(DEFAULT_DB_FILE_NAME) {
        Ok(out) => out,
        Err(err) => {
            eprintln!("{DEFAULT_DB_FILE_NAME}: {err}");
            exit(1);
        }
    };
    let mut out = BufWriter::new(out);
    for (user, labels) in &database {
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        if writeln!(out, "{user};{}", labels.join(";")).is_err() {
            eprintln!("error writing {DEFAULT_DB_FILE_NAME}");
            exit(1);
        }
    }
}

fn usage(progname: &str) {
    eprintln!("Syntax:");
    eprintln!("{progname} lst_files_dir_path");
    eprintln!("Where:");
    eprintln!("lst_files_dir_path     Full path of the .lst files directory");
}
