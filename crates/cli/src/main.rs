use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use nxrepack::cancel::CancelToken;
use nxrepack::crypto::keyset::KeySet;
use nxrepack::filesystem::{Entry, ReadableDirectoryExt, ReadableFile, ReadableFileSystem};
use nxrepack::formats::nca::{IntegrityCheckLevel, Nca};
use nxrepack::snafu::{ResultExt, Whatever};
use nxrepack::storage::{FileRoStorage, ReadableStorageExt};

#[derive(Parser, Debug)]
#[clap(about = "Inspect and extract Nintendo Switch content archives")]
struct Opts {
    /// Directory with prod.keys / title.keys (defaults to the system key dirs)
    #[clap(long)]
    keys: Option<Utf8PathBuf>,
    /// Skip integrity verification while reading
    #[clap(long, default_value = "false")]
    no_verify: bool,
    #[clap(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Print header and section information of an NCA
    Info { nca: Utf8PathBuf },
    /// Extract every section filesystem of an NCA into a directory
    Extract {
        nca: Utf8PathBuf,
        out_dir: Utf8PathBuf,
        /// Base NCA for update NCAs (enables the patched RomFS view)
        #[clap(long)]
        base: Option<Utf8PathBuf>,
    },
}

fn open_nca(keys: &KeySet, path: &Utf8PathBuf) -> Result<Nca<FileRoStorage>, Whatever> {
    let storage = FileRoStorage::open(path)
        .with_whatever_context(|_| format!("Opening {}", path))?;
    Nca::new(keys, storage).with_whatever_context(|_| format!("Decoding {}", path))
}

fn info(keys: &KeySet, nca: Utf8PathBuf) -> Result<(), Whatever> {
    let nca = open_nca(keys, &nca)?;

    println!("content type:  {:?}", nca.content_type());
    println!("title id:      {}", nca.title_id());
    if nca.rights_id().is_empty() {
        println!("crypto:        standard (key area)");
    } else {
        println!("crypto:        titlekey, rights id {}", nca.rights_id());
    }

    for (index, fs_header) in nca.headers().fs_headers.iter().enumerate() {
        let Some(fs_header) = fs_header else { continue };
        let entry = nca.headers().nca_header.section_table[index];
        println!(
            "section {}: {:?} {:?} [{:?}; {:#x} bytes]",
            index,
            fs_header.format_type,
            fs_header.encryption_type,
            entry.start,
            entry.size(),
        );
    }
    Ok(())
}

fn extract_fs<F: ReadableFileSystem>(fs: &F, out_dir: &Utf8PathBuf) -> Result<(), Whatever>
where
    for<'a> <F::File<'a> as ReadableFile>::Error: std::error::Error + Send + Sync + 'static,
{
    std::fs::create_dir_all(out_dir)
        .with_whatever_context(|_| format!("Creating {}", out_dir))?;

    for (path, entry) in fs.root().entries_recursive() {
        let target = out_dir.join(path.trim_start_matches('/'));
        match entry {
            Entry::Directory(_) => {
                std::fs::create_dir_all(&target)
                    .with_whatever_context(|_| format!("Creating {}", target))?;
            }
            Entry::File(file) => {
                println!("  {} ({} bytes)", target, file.size());
                file.storage()
                    .with_whatever_context(|_| format!("Opening {}", file.name()))?
                    .save_to_file(&target)
                    .with_whatever_context(|_| format!("Writing {}", target))?;
            }
        }
    }
    Ok(())
}

fn extract(
    keys: &KeySet,
    integrity: IntegrityCheckLevel,
    nca: Utf8PathBuf,
    out_dir: Utf8PathBuf,
    base: Option<Utf8PathBuf>,
) -> Result<(), Whatever> {
    let nca = open_nca(keys, &nca)?;
    let cancel = CancelToken::new();

    for index in 0..4 {
        let Some(fs) = nca.get_section_fs(index, integrity, &cancel) else {
            continue;
        };
        println!("section {}:", index);
        extract_fs(&fs, &out_dir.join(format!("section{}", index)))?;
    }

    if let Some(base) = base {
        let base = open_nca(keys, &base)?;
        let fs = nca
            .get_patched_romfs(&base, integrity, &cancel)
            .whatever_context("Assembling the patched RomFS")?;
        println!("patched romfs:");
        extract_fs(&fs, &out_dir.join("romfs_patched"))?;
    }
    Ok(())
}

fn main() -> Result<(), Whatever> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let keys = KeySet::from_system(opts.keys.as_deref().map(|p| p.as_std_path()))
        .whatever_context("Loading the keyset")?;
    let integrity = if opts.no_verify {
        IntegrityCheckLevel::None
    } else {
        IntegrityCheckLevel::Full
    };

    match opts.action {
        Action::Info { nca } => info(&keys, nca),
        Action::Extract { nca, out_dir, base } => extract(&keys, integrity, nca, out_dir, base),
    }
}
