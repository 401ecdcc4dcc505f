use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};

use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::debug;
use walkdir::WalkDir;

use super::error::{DockerError, Result};
use super::runner::{ContainerRunner, ExecOutput, RunOptions};
use super::stream::{ContainerFile, FileMode};

const COPY_CHUNK: usize = 8 * 1024;

/// A logged-in user's session inside a container, tracking a current
/// working directory.
///
/// Every operation delegates to the owning [`ContainerRunner`] with the
/// view's username fixed and the view's directory as the default workdir.
/// The directory is always an absolute path resolved by running `pwd`
/// in-container; [`chdir`] is the only mutator.
///
/// [`chdir`]: UserView::chdir
#[derive(Debug)]
pub struct UserView<'a> {
    runner: &'a ContainerRunner,
    username: String,
    cwd: String,
}

impl<'a> UserView<'a> {
    pub(crate) fn new(
        runner: &'a ContainerRunner,
        username: &str,
        workdir: Option<&str>,
    ) -> Result<Self> {
        let cwd = match workdir {
            None => runner.get_home_dir(username)?,
            Some(workdir) => {
                let output = runner.run_checked(
                    &["pwd"],
                    &RunOptions::new().user(username).workdir(workdir),
                )?;
                output.stdout_text().trim().to_string()
            }
        };
        Ok(Self {
            runner,
            username: username.to_string(),
            cwd,
        })
    }

    pub(crate) fn preresolved(runner: &'a ContainerRunner, username: String, cwd: String) -> Self {
        Self {
            runner,
            username,
            cwd,
        }
    }

    pub fn runner(&self) -> &ContainerRunner {
        self.runner
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn getcwd(&self) -> &str {
        &self.cwd
    }

    pub fn home(&self) -> Result<String> {
        self.runner.get_home_dir(&self.username)
    }

    /// Execute a command as this view's user. `opts.workdir` overrides the
    /// view's directory for this call only; `opts.user` is ignored.
    pub fn run(&self, cmd: &[&str], opts: &RunOptions) -> Result<ExecOutput> {
        self.runner.run(cmd, &self.scoped(opts))
    }

    pub fn run_checked(&self, cmd: &[&str], opts: &RunOptions) -> Result<ExecOutput> {
        self.runner.run_checked(cmd, &self.scoped(opts))
    }

    fn scoped(&self, opts: &RunOptions) -> RunOptions {
        let mut opts = opts.clone();
        opts.user = Some(self.username.clone());
        if opts.workdir.is_none() {
            opts.workdir = Some(self.cwd.clone());
        }
        opts
    }

    /// Open a file relative to the view's directory.
    pub fn open(&self, path: &str, mode: FileMode) -> Result<ContainerFile> {
        self.runner.open(path, mode, &self.scoped(&RunOptions::new()))
    }

    pub fn makedirs(&self, path: &str, exist_ok: bool) -> Result<()> {
        self.runner
            .makedirs(path, exist_ok, &self.scoped(&RunOptions::new()))
    }

    /// Change the view's directory. The new path is re-resolved to an
    /// absolute one by running `pwd` under it.
    pub fn chdir(&mut self, new_dir: &str) -> Result<()> {
        let output = self.run_checked(&["pwd"], &RunOptions::new().workdir(new_dir))?;
        self.cwd = output.stdout_text().trim().to_string();
        Ok(())
    }

    /// Copy a host file or directory into the container *as this view's
    /// user*, unlike `docker cp` which lands files with the container's
    /// default ownership.
    ///
    /// Directories stream as a gzip tarball into an in-container `tar -x`,
    /// with owner/group metadata stripped from every entry so the
    /// extracting user's chown semantics apply. Single files stream in
    /// fixed-size chunks through a write-mode [`ContainerFile`], creating
    /// the destination's parent first when `makedirs` is set.
    pub fn copy_to(&self, src_path: &Path, dest_path: &str, makedirs: bool) -> Result<()> {
        if !src_path.exists() {
            return Err(DockerError::FileNotFound {
                path: src_path.display().to_string(),
            });
        }
        if src_path.is_dir() {
            self.copy_dir_to(src_path, dest_path)
        } else {
            self.copy_file_to(src_path, dest_path, makedirs)
        }
    }

    fn copy_dir_to(&self, src: &Path, dest: &str) -> Result<()> {
        self.run_checked(&["mkdir", "-p", dest], &RunOptions::new())?;

        debug!(src = %src.display(), dest, "streaming directory into container");
        let mut child = Command::new("docker")
            .args(["exec", "-i", "-u", &self.username, "-w", &self.cwd])
            .arg(self.runner.container_name())
            .args(["tar", "-C", dest, "-xzf", "-"])
            .stdin(Stdio::piped())
            .spawn()?;
        let stdin = child.stdin.take().expect("stdin was piped");

        let encoder = GzEncoder::new(stdin, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        append_dir_contents(&mut builder, src)?;
        let encoder = builder.into_inner()?;
        let stdin = encoder.finish()?;
        drop(stdin);

        let status = child.wait()?;
        if !status.success() {
            return Err(DockerError::TransferFailed {
                code: status.code(),
            });
        }
        Ok(())
    }

    fn copy_file_to(&self, src: &Path, dest: &str, makedirs: bool) -> Result<()> {
        if makedirs {
            self.makedirs(parent_dir(dest), true)?;
        }
        let mut source = File::open(src)?;
        let mut stream = self.open(dest, FileMode::Write)?;
        let mut buf = [0u8; COPY_CHUNK];
        loop {
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n])?;
        }
        stream.close()
    }

    /// Write `contents` to a file relative to the view's directory,
    /// returning the byte count.
    pub fn write_file(&self, file_name: &str, contents: &[u8]) -> Result<usize> {
        let mut stream = self.open(file_name, FileMode::Write)?;
        stream.write_all(contents)?;
        stream.close()?;
        Ok(contents.len())
    }

    /// Read a whole file relative to the view's directory.
    pub fn read_file(&self, file_name: &str) -> Result<Vec<u8>> {
        let mut stream = self.open(file_name, FileMode::Read)?;
        stream.read_all()
    }
}

/// Append the immediate contents of `src` (recursively) with uid/gid and
/// user/group names cleared, so extraction assigns ownership to the
/// executing user rather than replaying the host's.
fn append_dir_contents<W: Write>(builder: &mut tar::Builder<W>, src: &Path) -> Result<()> {
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| DockerError::InvalidArgument(e.to_string()))?
            .to_path_buf();
        let metadata = entry.metadata().map_err(io::Error::from)?;

        let mut header = tar::Header::new_gnu();
        header.set_metadata(&metadata);
        header.set_uid(0);
        header.set_gid(0);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, &rel, io::empty())?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, &rel, &target)?;
        } else {
            let mut file = File::open(entry.path())?;
            builder.append_data(&mut header, &rel, &mut file)?;
        }
    }
    Ok(())
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    #[test]
    fn parent_dir_handles_common_shapes() {
        assert_eq!(parent_dir("a/b/c.txt"), "a/b");
        assert_eq!(parent_dir("/etc/hosts"), "/etc");
        assert_eq!(parent_dir("/top"), "/");
        assert_eq!(parent_dir("file.txt"), ".");
    }

    #[test]
    fn tar_entries_have_ownership_stripped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/file.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("top.txt"), b"world").unwrap();

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        append_dir_contents(&mut builder, dir.path()).unwrap();
        let gz = builder.into_inner().unwrap().finish().unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(&gz[..]));
        let mut paths = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.uid().unwrap(), 0);
            assert_eq!(header.gid().unwrap(), 0);
            paths.push(entry.path().unwrap().to_string_lossy().into_owned());
        }
        paths.sort();
        assert_eq!(paths, vec!["sub", "sub/file.txt", "top.txt"]);
    }

    #[test]
    fn tar_preserves_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), [0u8, 1, 2, 250]).unwrap();

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        append_dir_contents(&mut builder, dir.path()).unwrap();
        let gz = builder.into_inner().unwrap().finish().unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(&gz[..]));
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, vec![0u8, 1, 2, 250]);
    }
}
