//! Submit command: run files on a remote server.

use std::path::{Path, PathBuf};

use simpool_core::remote::{RemoteFile, submit};

use crate::colors;

pub fn execute(addr: &str, files: &[PathBuf], out_dir: &Path) -> anyhow::Result<()> {
    let uploads = files
        .iter()
        .map(|path| RemoteFile::read(path))
        .collect::<Result<Vec<_>, _>>()?;

    let submission = submit(addr, &uploads, |line| println!("{}", line))?;

    std::fs::create_dir_all(out_dir)?;
    for file in &submission.files {
        let path = file.write_into(out_dir)?;
        println!("{}received{} {}", colors::DIM, colors::RESET, path.display());
    }

    if !submission.succeeded() {
        anyhow::bail!("remote command exited with code {}", submission.exit_code);
    }
    println!("{}Done.{}", colors::GREEN, colors::RESET);
    Ok(())
}
