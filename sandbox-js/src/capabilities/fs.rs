//! Filesystem scoped to the job directory
//!
//! `fs` covers the parts of Node's API extraction scripts reach for: the
//! `*Sync` functions and `fs.promises`. Contents are text (UTF-8). Every
//! path is resolved against the job directory and has to stay inside it,
//! symlinks included; anything else throws `PermissionDenied`.

use rquickjs::function::Opt;
use rquickjs::{Coerced, Ctx, Exception, Function, Object};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;

use crate::capability::{Capability, CapabilityMetadata};
use crate::errors::permission_denied;
use crate::util;

const FS_SOURCE: &str = r#"
(function (native) {
  'use strict';
  const flag = (options, key) =>
    typeof options === 'object' && options !== null && options[key] === true;
  const text = (data) => (typeof data === 'string' ? data : String(data));
  const dir = (path) => (path === undefined ? '.' : String(path));

  const fs = {
    readFileSync: (path) => native.read(String(path)),
    writeFileSync: (path, data) => native.write(String(path), text(data), false),
    appendFileSync: (path, data) => native.write(String(path), text(data), true),
    readdirSync: (path) => native.readdir(dir(path)),
    mkdirSync: (path, options) => native.mkdir(String(path), flag(options, 'recursive')),
    rmSync: (path, options) =>
      native.rm(String(path), flag(options, 'recursive'), flag(options, 'force')),
    existsSync: (path) => native.exists(String(path)),
    statSync(path) {
      const stat = native.stat(String(path));
      return Object.freeze({
        size: stat.size,
        mtimeMs: stat.mtimeMs,
        isFile: () => stat.file,
        isDirectory: () => stat.directory,
      });
    },
  };

  const promises = {
    readFile: async (...args) => fs.readFileSync(...args),
    writeFile: async (...args) => fs.writeFileSync(...args),
    appendFile: async (...args) => fs.appendFileSync(...args),
    readdir: async (...args) => fs.readdirSync(...args),
    mkdir: async (...args) => fs.mkdirSync(...args),
    rm: async (...args) => fs.rmSync(...args),
    stat: async (...args) => fs.statSync(...args),
  };

  fs.promises = Object.freeze(promises);
  return fs;
})
"#;

/// Filesystem errors, as seen by scripts
#[derive(Debug, Error)]
pub enum FsError {
    #[error("access to \"{0}\" is not allowed in the sandbox")]
    Outside(String),

    #[error("{op} \"{path}\": {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    fn io<'a>(op: &'static str, path: &'a str) -> impl FnOnce(io::Error) -> FsError + 'a {
        move |source| FsError::Io {
            op,
            path: path.to_string(),
            source,
        }
    }

    /// Node-style error code
    pub fn code(&self) -> &'static str {
        let FsError::Io { source, .. } = self else {
            return "EACCES";
        };
        match source.kind() {
            io::ErrorKind::NotFound => "ENOENT",
            io::ErrorKind::AlreadyExists => "EEXIST",
            io::ErrorKind::PermissionDenied => "EACCES",
            io::ErrorKind::DirectoryNotEmpty => "ENOTEMPTY",
            io::ErrorKind::IsADirectory => "EISDIR",
            io::ErrorKind::NotADirectory => "ENOTDIR",
            _ => "EIO",
        }
    }
}

/// Size, kind and modification time of a path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileStat {
    pub size: u64,
    pub file: bool,
    pub directory: bool,
    pub mtime_ms: f64,
}

/// File access confined to one directory
#[derive(Debug, Clone)]
pub struct ScopedFs {
    root: PathBuf,
}

impl ScopedFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: normalize(Path::new("/"), &root.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a script path onto the host, refusing anything outside the root
    ///
    /// Relative paths start at the root. `..` is applied lexically, then the
    /// deepest existing ancestor is canonicalized so that a symlink cannot
    /// lead out of the directory.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let resolved = normalize(&self.root, Path::new(path));
        if !resolved.starts_with(&self.root) {
            return Err(FsError::Outside(path.to_string()));
        }

        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        let mut existing = resolved.as_path();
        while std::fs::symlink_metadata(existing).is_err() {
            match existing.parent() {
                Some(parent) => existing = parent,
                None => return Ok(resolved),
            }
        }
        match existing.canonicalize() {
            Ok(real) if real.starts_with(&root) => Ok(resolved),
            _ => Err(FsError::Outside(path.to_string())),
        }
    }

    pub fn read(&self, path: &str) -> Result<String, FsError> {
        let target = self.resolve(path)?;
        let bytes = std::fs::read(target).map_err(FsError::io("read", path))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn write(&self, path: &str, contents: &str, append: bool) -> Result<(), FsError> {
        use std::io::Write;

        let target = self.resolve(path)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(target)
            .map_err(FsError::io("open", path))?;
        file.write_all(contents.as_bytes())
            .map_err(FsError::io("write", path))
    }

    /// Entry names of a directory, sorted
    pub fn read_dir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let target = self.resolve(path)?;
        let mut names = std::fs::read_dir(target)
            .map_err(FsError::io("readdir", path))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }

    pub fn mkdir(&self, path: &str, recursive: bool) -> Result<(), FsError> {
        let target = self.resolve(path)?;
        let created = if recursive {
            std::fs::create_dir_all(target)
        } else {
            std::fs::create_dir(target)
        };
        created.map_err(FsError::io("mkdir", path))
    }

    /// Removes a file, or a directory when `recursive` is set
    ///
    /// The root itself can never be removed. With `force`, a missing path
    /// is not an error.
    pub fn remove(&self, path: &str, recursive: bool, force: bool) -> Result<(), FsError> {
        let target = self.resolve(path)?;
        if target == self.root {
            return Err(FsError::Outside(path.to_string()));
        }

        let removed = match std::fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() && recursive => std::fs::remove_dir_all(&target),
            Ok(meta) if meta.is_dir() => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                "is a directory, pass { recursive: true }",
            )),
            Ok(_) => std::fs::remove_file(&target),
            Err(e) => Err(e),
        };
        match removed {
            Err(e) if force && e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other.map_err(FsError::io("rm", path)),
        }
    }

    pub fn exists(&self, path: &str) -> Result<bool, FsError> {
        let target = self.resolve(path)?;
        Ok(std::fs::symlink_metadata(target).is_ok())
    }

    pub fn stat(&self, path: &str) -> Result<FileStat, FsError> {
        let target = self.resolve(path)?;
        let meta = std::fs::metadata(target).map_err(FsError::io("stat", path))?;
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_millis() as f64)
            .unwrap_or_default();
        Ok(FileStat {
            size: meta.len(),
            file: meta.is_file(),
            directory: meta.is_dir(),
            mtime_ms,
        })
    }
}

/// Joins `path` onto `base` and folds `.` and `..` without touching the disk
fn normalize(base: &Path, path: &Path) -> PathBuf {
    let mut resolved = if path.is_absolute() {
        PathBuf::from("/")
    } else {
        base.to_path_buf()
    };
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => resolved.push(name),
        }
    }
    resolved
}

/// Throws the error into the context
fn throw(ctx: &Ctx<'_>, error: FsError) -> rquickjs::Error {
    if let FsError::Outside(_) = error {
        return permission_denied(ctx, &error.to_string());
    }
    let exception = match Exception::from_message(ctx.clone(), &error.to_string()) {
        Ok(exception) => exception,
        Err(err) => return err,
    };
    if let Err(err) = exception.set("code", error.code()) {
        return err;
    }
    ctx.throw(exception.into_value())
}

pub struct FsCapability {
    fs: ScopedFs,
}

impl FsCapability {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            fs: ScopedFs::new(root),
        }
    }

    fn native<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
        let native = Object::new(ctx.clone())?;

        let fs = self.fs.clone();
        native.set(
            "read",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, path: Coerced<String>| {
                fs.read(&path.0).map_err(|e| throw(&ctx, e))
            })?,
        )?;

        let fs = self.fs.clone();
        native.set(
            "write",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, path: Coerced<String>, contents: Coerced<String>, append: Opt<bool>| {
                    fs.write(&path.0, &contents.0, append.0.unwrap_or(false))
                        .map_err(|e| throw(&ctx, e))
                },
            )?,
        )?;

        let fs = self.fs.clone();
        native.set(
            "readdir",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, path: Coerced<String>| {
                fs.read_dir(&path.0).map_err(|e| throw(&ctx, e))
            })?,
        )?;

        let fs = self.fs.clone();
        native.set(
            "mkdir",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, path: Coerced<String>, recursive: Opt<bool>| {
                    fs.mkdir(&path.0, recursive.0.unwrap_or(false))
                        .map_err(|e| throw(&ctx, e))
                },
            )?,
        )?;

        let fs = self.fs.clone();
        native.set(
            "rm",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, path: Coerced<String>, recursive: Opt<bool>, force: Opt<bool>| {
                    fs.remove(&path.0, recursive.0.unwrap_or(false), force.0.unwrap_or(false))
                        .map_err(|e| throw(&ctx, e))
                },
            )?,
        )?;

        let fs = self.fs.clone();
        native.set(
            "exists",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, path: Coerced<String>| {
                fs.exists(&path.0).map_err(|e| throw(&ctx, e))
            })?,
        )?;

        let fs = self.fs.clone();
        native.set(
            "stat",
            Function::new(ctx.clone(), move |ctx: Ctx<'js>, path: Coerced<String>| {
                let stat = fs.stat(&path.0).map_err(|e| throw(&ctx, e))?;
                let object = Object::new(ctx.clone())?;
                object.set("size", stat.size as f64)?;
                object.set("file", stat.file)?;
                object.set("directory", stat.directory)?;
                object.set("mtimeMs", stat.mtime_ms)?;
                Ok::<_, rquickjs::Error>(object)
            })?,
        )?;

        Ok(native)
    }
}

impl Capability for FsCapability {
    fn id(&self) -> &'static str {
        "fs"
    }

    fn install<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<()> {
        let factory: Function = ctx.eval(FS_SOURCE)?;
        let fs: Object = factory.call((self.native(ctx)?,))?;
        util::freeze(ctx, &fs)?;
        util::define_locked(&ctx.globals(), "fs", fs)
    }

    fn declarations(&self) -> String {
        r#"interface SandboxStat {
  readonly size: number;
  readonly mtimeMs: number;
  isFile(): boolean;
  isDirectory(): boolean;
}
/** Text files inside the job directory; other paths throw PermissionDenied */
declare const fs: {
  readFileSync(path: string, encoding?: string | { encoding?: string }): string;
  writeFileSync(path: string, data: string): void;
  appendFileSync(path: string, data: string): void;
  readdirSync(path?: string): string[];
  mkdirSync(path: string, options?: { recursive?: boolean }): void;
  rmSync(path: string, options?: { recursive?: boolean; force?: boolean }): void;
  existsSync(path: string): boolean;
  statSync(path: string): SandboxStat;
  readonly promises: {
    readFile(path: string, encoding?: string | { encoding?: string }): Promise<string>;
    writeFile(path: string, data: string): Promise<void>;
    appendFile(path: string, data: string): Promise<void>;
    readdir(path?: string): Promise<string[]>;
    mkdir(path: string, options?: { recursive?: boolean }): Promise<void>;
    rm(path: string, options?: { recursive?: boolean; force?: boolean }): Promise<void>;
    stat(path: string): Promise<SandboxStat>;
  };
};
"#
        .to_string()
    }

    fn metadata(&self) -> CapabilityMetadata {
        CapabilityMetadata {
            id: self.id(),
            version: "1.0.0",
            description: "Text file access confined to the job directory",
        }
    }
}
