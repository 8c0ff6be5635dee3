//! silo command line interface

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use silo::treediff::FlatTree;
use silo::types::tree::{
    ATTR_CTIME, ATTR_FILESIZE, ATTR_GROUPNAME, ATTR_MTIME, ATTR_PERMS, ATTR_SYMLINK,
    ATTR_USERNAME,
};
use silo::types::{Commit, EntryType, TreeEntry};
use silo::{Hash, ObjectType, Repo};

#[derive(Parser)]
#[command(name = "silo")]
#[command(about = "content-addressed versioned filesystem store")]
#[command(version)]
struct Cli {
    /// repository path
    #[arg(short, long, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// initialize a new repository
    Init {
        /// path to create the repository at
        #[arg(default_value = ".")]
        path: PathBuf,

        /// create a bare repository (no working tree)
        #[arg(long)]
        bare: bool,
    },

    /// show repository information
    Show,

    /// list stored objects
    Listobj,

    /// verify every stored object
    Verify,

    /// show reference counts
    Refcount {
        /// object hash; all nonzero counts when omitted
        hash: Option<String>,
    },

    /// schedule an unreferenced blob for removal
    Purgeobj {
        /// object hash
        hash: String,
    },

    /// commit the working tree
    Commit {
        /// commit message
        #[arg(short, long)]
        message: String,

        /// directory to commit; defaults to the repository root
        #[arg(long)]
        source: Option<PathBuf>,
    },

    /// fetch objects from another repository
    Pull {
        /// path to the source repository
        source: PathBuf,
    },

    /// compact logs and drop purged objects
    Gc,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run(cli: Cli) -> silo::Result<()> {
    match cli.command {
        Commands::Init { path, bare } => {
            let repo = Repo::init(&path, bare)?;
            println!("initialized repository {} at {}", repo.uuid(), path.display());
        }

        Commands::Show => {
            let repo = Repo::open(&cli.repo)?;
            println!("root:    {}", repo.root().display());
            println!("uuid:    {}", repo.uuid());
            println!("version: {}", repo.version());
            match repo.branch()? {
                Some(branch) => println!("branch:  {}", branch),
                None => println!("branch:  (detached)"),
            }
            println!("head:    {}", repo.head()?);
        }

        Commands::Listobj => {
            let repo = Repo::open(&cli.repo)?;
            for info in repo.list_objects() {
                println!("{} {:9} {}", info.hash, info.kind.name(), info.payload_size);
            }
        }

        Commands::Verify => {
            let mut repo = Repo::open(&cli.repo)?;
            let failures = repo.verify();
            if failures.is_empty() {
                println!("verified {} objects", repo.list_objects().len());
            } else {
                for (hash, reason) in &failures {
                    eprintln!("{}: {}", hash, reason);
                }
                return Err(silo::Error::Corrupt(format!(
                    "{} objects failed verification",
                    failures.len()
                )));
            }
        }

        Commands::Refcount { hash } => {
            let repo = Repo::open(&cli.repo)?;
            match hash {
                Some(hex) => {
                    let hash = Hash::from_hex(&hex)?;
                    println!("{} {}", hash, repo.ref_count(&hash));
                }
                None => {
                    let mut sorted: Vec<_> = repo
                        .ref_counts()
                        .iter()
                        .filter(|(_, &c)| c != 0)
                        .map(|(h, &c)| (*h, c))
                        .collect();
                    sorted.sort_by_key(|(h, _)| *h);
                    for (hash, count) in sorted {
                        println!("{} {}", hash, count);
                    }
                }
            }
        }

        Commands::Purgeobj { hash } => {
            let mut repo = Repo::open(&cli.repo)?;
            let _lock = repo.lock()?;
            let hash = Hash::from_hex(&hash)?;

            // only loose blobs are purgeable by hand
            match repo.get_object_info(&hash) {
                Some(info) if info.kind == ObjectType::Blob => {}
                Some(info) => {
                    return Err(silo::Error::Unsupported(format!(
                        "cannot purge {} object {}",
                        info.kind, hash
                    )))
                }
                None => return Err(silo::Error::ObjectNotFound(hash)),
            }
            repo.purge_object(&hash)?;
            println!("scheduled {} for removal; run gc to reclaim space", hash);
        }

        Commands::Commit { message, source } => {
            let mut repo = Repo::open(&cli.repo)?;
            let _lock = repo.lock()?;

            let source = source.unwrap_or_else(|| cli.repo.clone());
            let mut flat = FlatTree::new();
            scan_directory(&mut repo, &source, "", &mut flat)?;
            let tree = repo.materialize_flat_tree(&flat)?;

            let commit_hash = repo.commit_from_tree(&tree, Commit::new(tree, message), "normal")?;
            repo.sync()?;
            println!("{}", commit_hash);
        }

        Commands::Pull { source } => {
            let mut repo = Repo::open(&cli.repo)?;
            let mut other = Repo::open(&source)?;
            let stats = repo.pull(&mut other)?;
            repo.sync()?;
            println!(
                "received {} objects in {} batches",
                stats.received_objects, stats.batches
            );
        }

        Commands::Gc => {
            let mut repo = Repo::open(&cli.repo)?;
            let _lock = repo.lock()?;
            repo.gc()?;
            println!("compacted repository");
        }
    }

    Ok(())
}

/// walk a directory into a flattened tree, storing file contents as we go
fn scan_directory(
    repo: &mut Repo,
    dir: &Path,
    prefix: &str,
    flat: &mut FlatTree,
) -> silo::Result<()> {
    use std::os::unix::fs::MetadataExt;

    let entries = std::fs::read_dir(dir).map_err(|e| silo::Error::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| silo::Error::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == ".silo" {
            continue;
        }
        let path = entry.path();
        let meta = std::fs::symlink_metadata(&path).map_err(|e| silo::Error::Io {
            path: path.clone(),
            source: e,
        })?;
        let full = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };

        let attrs = |entry: TreeEntry, size: u64| {
            entry
                .with_attr(ATTR_PERMS, format!("{:o}", meta.mode() & 0o7777))
                .with_attr(ATTR_USERNAME, user_name(meta.uid()))
                .with_attr(ATTR_GROUPNAME, group_name(meta.gid()))
                .with_attr(ATTR_FILESIZE, size.to_string())
                .with_attr(ATTR_MTIME, meta.mtime().max(0).to_string())
                .with_attr(ATTR_CTIME, meta.ctime().max(0).to_string())
        };

        if meta.is_dir() {
            let placeholder = attrs(TreeEntry::new(EntryType::Tree, Hash::ZERO), 0);
            flat.insert(full.clone(), placeholder);
            scan_directory(repo, &path, &full, flat)?;
        } else if meta.is_symlink() {
            let target = std::fs::read_link(&path).map_err(|e| silo::Error::Io {
                path: path.clone(),
                source: e,
            })?;
            let target = target.to_string_lossy().into_owned();
            let hash = repo.add_blob(ObjectType::Blob, target.as_bytes())?;
            let entry = attrs(TreeEntry::new(EntryType::Symlink, hash), target.len() as u64)
                .with_attr(ATTR_SYMLINK, "true");
            flat.insert(full, entry);
        } else if meta.is_file() {
            let (primary, large) = repo.add_file(&path)?;
            let kind = if large.is_zero() {
                EntryType::Blob
            } else {
                EntryType::LargeBlob
            };
            let mut entry = attrs(TreeEntry::new(kind, primary), meta.len());
            if !large.is_zero() {
                entry = entry.with_large_hash(large);
            }
            flat.insert(full, entry);
        }
        // sockets, fifos, and devices are not tracked
    }
    Ok(())
}

fn user_name(uid: u32) -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| uid.to_string())
}

fn group_name(gid: u32) -> String {
    nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_else(|| gid.to_string())
}
