// Copyright 2024 The Zeta Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Named references and the append-only reflog.
//!
//! Each reference is one file: either `"<64-hex>\n"` or `"ref: <target>\n"`.
//! Updates are compare-and-swap: the on-disk value is read, compared against
//! the caller's expectation, and replaced through a temp file + rename.
//! Within a process updates are serialized per name; across processes the
//! rename keeps the file itself consistent.

use std::fs;
use std::io;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

use crate::file_util::PathError;
use crate::file_util::remove_empty_dirs_upward;
use crate::file_util::write_atomically;
use crate::hash::ObjectId;
use crate::object::Signature;
use crate::object::Timestamp;

pub const HEAD_NAME: &str = "HEAD";
pub const FETCH_HEAD_NAME: &str = "FETCH_HEAD";
pub const MERGE_HEAD_NAME: &str = "MERGE_HEAD";
pub const STASH_REF: &str = "refs/stash";
pub const BRANCH_PREFIX: &str = "refs/heads/";
pub const TAG_PREFIX: &str = "refs/tags/";
pub const REMOTE_PREFIX: &str = "refs/remotes/";

#[derive(Debug, Error)]
pub enum RefError {
    #[error("Reference {0} not found")]
    NotFound(String),
    #[error("Invalid reference name {0:?}")]
    InvalidName(String),
    #[error("Reference {name} changed concurrently (expected {expected:?}, found {actual:?})")]
    Precondition {
        name: String,
        expected: Option<String>,
        actual: Option<String>,
    },
    #[error("Reference name {name:?} collides with existing {existing:?}")]
    Collision { name: String, existing: String },
    #[error("Malformed reference file for {0}")]
    Corrupt(String),
    #[error("Malformed reflog for {name} at line {line}")]
    CorruptLog { name: String, line: usize },
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("Reference I/O error")]
    Io(#[from] io::Error),
}

pub type RefResult<T> = Result<T, RefError>;

/// A named reference: either direct (to an object) or symbolic (to another
/// reference).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Hash { name: String, target: ObjectId },
    Symbolic { name: String, target: String },
}

impl Reference {
    pub fn name(&self) -> &str {
        match self {
            Self::Hash { name, .. } | Self::Symbolic { name, .. } => name,
        }
    }

    pub fn hash_target(&self) -> Option<ObjectId> {
        match self {
            Self::Hash { target, .. } => Some(*target),
            Self::Symbolic { .. } => None,
        }
    }

    fn file_content(&self) -> String {
        match self {
            Self::Hash { target, .. } => format!("{}\n", target.hex()),
            Self::Symbolic { target, .. } => format!("ref: {target}\n"),
        }
    }
}

/// One append-only history record of a reference move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflogEntry {
    pub old: ObjectId,
    pub new: ObjectId,
    pub committer: Signature,
    pub message: String,
}

/// A reference's full log, oldest entry first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reflog {
    pub name: String,
    pub entries: Vec<ReflogEntry>,
}

/// Checks a branch's short name: no leading/trailing or doubled slashes, no
/// `..`, no control characters or blanks, and not a reserved name.
pub fn validate_branch_name(name: &str) -> RefResult<()> {
    let bad = || RefError::InvalidName(name.to_owned());
    if name.is_empty() || name == HEAD_NAME {
        return Err(bad());
    }
    if name.starts_with('/') || name.ends_with('/') || name.ends_with('.') {
        return Err(bad());
    }
    if name.contains("..") || name.contains("//") || name.contains("@{") {
        return Err(bad());
    }
    for component in name.split('/') {
        if component.is_empty() || component.starts_with('.') || component.ends_with(".lock") {
            return Err(bad());
        }
    }
    if name
        .chars()
        .any(|c| c.is_control() || c == ' ' || c == '~' || c == '^' || c == ':' || c == '\\')
    {
        return Err(bad());
    }
    Ok(())
}

#[derive(Debug)]
pub struct RefDb {
    root: PathBuf,
    // Serializes read-compare-write sequences within this process.
    write_lock: Mutex<()>,
}

impl RefDb {
    pub fn init(root: &Path) -> RefResult<Self> {
        fs::create_dir_all(root.join("refs/heads"))?;
        fs::create_dir_all(root.join("refs/tags"))?;
        fs::create_dir_all(root.join("logs"))?;
        Ok(Self::load(root))
    }

    pub fn load(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.root.join("logs").join(name)
    }

    fn read_raw(&self, name: &str) -> RefResult<Option<Reference>> {
        let path = self.ref_path(name);
        // A directory at the name means nested refs live below it, not a
        // reference itself.
        if path.is_dir() {
            return Ok(None);
        }
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let line = content.strip_suffix('\n').unwrap_or(&content);
        if let Some(target) = line.strip_prefix("ref: ") {
            Ok(Some(Reference::Symbolic {
                name: name.to_owned(),
                target: target.to_owned(),
            }))
        } else if let Some(target) = ObjectId::try_from_hex(line) {
            Ok(Some(Reference::Hash {
                name: name.to_owned(),
                target,
            }))
        } else {
            Err(RefError::Corrupt(name.to_owned()))
        }
    }

    /// Reads the reference stored at `name` without following symbolic
    /// links.
    pub fn reference(&self, name: &str) -> RefResult<Reference> {
        self.read_raw(name)?
            .ok_or_else(|| RefError::NotFound(name.to_owned()))
    }

    /// Follows symbolic references until a hash reference is found.
    pub fn resolve(&self, name: &str) -> RefResult<Reference> {
        let mut current = name.to_owned();
        // Symbolic chains are short; a bound guards against cycles.
        for _ in 0..10 {
            match self.reference(&current)? {
                Reference::Symbolic { target, .. } => current = target,
                reference @ Reference::Hash { .. } => return Ok(reference),
            }
        }
        Err(RefError::Corrupt(name.to_owned()))
    }

    /// The current `HEAD` reference: symbolic while on a branch, direct
    /// when detached.
    pub fn head(&self) -> RefResult<Reference> {
        self.reference(HEAD_NAME)
    }

    /// The short branch name `HEAD` points at, unless detached.
    pub fn current_branch(&self) -> RefResult<Option<String>> {
        match self.head()? {
            Reference::Symbolic { target, .. } => {
                Ok(target.strip_prefix(BRANCH_PREFIX).map(str::to_owned))
            }
            Reference::Hash { .. } => Ok(None),
        }
    }

    /// Compare-and-swap update. `expected_old` is the value the file must
    /// currently hold (`None` = must not exist).
    pub fn update(&self, new_ref: &Reference, expected_old: Option<&Reference>) -> RefResult<()> {
        let name = new_ref.name();
        let _guard = self.write_lock.lock().unwrap();
        let actual = self.read_raw(name)?;
        if actual.as_ref() != expected_old {
            return Err(RefError::Precondition {
                name: name.to_owned(),
                expected: expected_old.map(|r| r.file_content().trim_end().to_owned()),
                actual: actual.map(|r| r.file_content().trim_end().to_owned()),
            });
        }
        let path = self.ref_path(name);
        fs::create_dir_all(path.parent().unwrap())?;
        write_atomically(&path, new_ref.file_content().as_bytes())?;
        debug!(name, "reference updated");
        Ok(())
    }

    /// Unconditional update, for single-writer slots like `FETCH_HEAD`.
    pub fn force_update(&self, new_ref: &Reference) -> RefResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.ref_path(new_ref.name());
        fs::create_dir_all(path.parent().unwrap())?;
        write_atomically(&path, new_ref.file_content().as_bytes())?;
        Ok(())
    }

    /// Deletes the reference, failing `Precondition` if it moved since the
    /// caller read `expected`.
    pub fn remove(&self, name: &str, expected: Option<&Reference>) -> RefResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        let actual = self.read_raw(name)?;
        if actual.is_none() {
            return Err(RefError::NotFound(name.to_owned()));
        }
        if expected.is_some() && actual.as_ref() != expected {
            return Err(RefError::Precondition {
                name: name.to_owned(),
                expected: expected.map(|r| r.file_content().trim_end().to_owned()),
                actual: actual.map(|r| r.file_content().trim_end().to_owned()),
            });
        }
        fs::remove_file(self.ref_path(name))?;
        if let Some(parent) = self.ref_path(name).parent() {
            remove_empty_dirs_upward(parent, &self.root);
        }
        Ok(())
    }

    /// Existing reference names that collide with `name` in the hierarchy:
    /// `name` itself, any ref filed under `name/`, and any ancestor of
    /// `name` that exists as a ref.
    pub fn prefix_match(&self, name: &str) -> RefResult<Vec<String>> {
        let mut matches = Vec::new();
        if self.read_raw(name)?.is_some() {
            matches.push(name.to_owned());
        }
        // An existing ref "refs/heads/foo" blocks creating
        // "refs/heads/foo/bar" and vice versa.
        let mut ancestor = name;
        while let Some((parent, _)) = ancestor.rsplit_once('/') {
            if self.read_raw(parent)?.is_some() {
                matches.push(parent.to_owned());
            }
            ancestor = parent;
        }
        let dir = self.ref_path(name);
        if dir.is_dir() {
            let mut nested = Vec::new();
            collect_refs(&dir, name, &mut nested)?;
            matches.extend(nested);
        }
        matches.sort();
        Ok(matches)
    }

    /// Lists hash and symbolic references under `prefix` (e.g.
    /// `refs/heads/`), sorted by name.
    pub fn list(&self, prefix: &str) -> RefResult<Vec<Reference>> {
        let dir = self.ref_path(prefix.trim_end_matches('/'));
        let mut names = Vec::new();
        if dir.is_dir() {
            collect_refs(&dir, prefix.trim_end_matches('/'), &mut names)?;
        }
        names.sort();
        names.into_iter().map(|name| self.reference(&name)).collect()
    }

    /// Reads the full reflog for `name`, oldest first. A malformed line is
    /// reported as corruption rather than silently dropped; ref updates do
    /// not read the log, so the reference itself stays usable.
    pub fn read_log(&self, name: &str) -> RefResult<Reflog> {
        let content = match fs::read_to_string(self.log_path(name)) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Reflog {
                    name: name.to_owned(),
                    entries: Vec::new(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            entries.push(parse_log_line(line).ok_or(RefError::CorruptLog {
                name: name.to_owned(),
                line: lineno + 1,
            })?);
        }
        Ok(Reflog {
            name: name.to_owned(),
            entries,
        })
    }

    /// Appends one reflog entry, unless the move is a no-op (`old == new`).
    pub fn append_log(
        &self,
        name: &str,
        old: ObjectId,
        new: ObjectId,
        committer: &Signature,
        message: &str,
    ) -> RefResult<()> {
        if old == new {
            return Ok(());
        }
        let path = self.log_path(name);
        fs::create_dir_all(path.parent().unwrap())?;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(format_log_line(old, new, committer, message).as_bytes())?;
        Ok(())
    }

    /// Rewrites a reflog wholesale (used when an entry is dropped, e.g. by
    /// stash pop).
    pub fn write_log(&self, reflog: &Reflog) -> RefResult<()> {
        let path = self.log_path(&reflog.name);
        fs::create_dir_all(path.parent().unwrap())?;
        let mut content = String::new();
        for entry in &reflog.entries {
            content.push_str(&format_log_line(
                entry.old,
                entry.new,
                &entry.committer,
                &entry.message,
            ));
        }
        write_atomically(&path, content.as_bytes())?;
        Ok(())
    }

    pub fn delete_log(&self, name: &str) -> RefResult<()> {
        match fs::remove_file(self.log_path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn collect_refs(dir: &Path, prefix: &str, out: &mut Vec<String>) -> RefResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(file_name) = entry.file_name().into_string() else {
            continue;
        };
        let name = format!("{prefix}/{file_name}");
        if entry.file_type()?.is_dir() {
            collect_refs(&entry.path(), &name, out)?;
        } else {
            out.push(name);
        }
    }
    Ok(())
}

fn format_log_line(old: ObjectId, new: ObjectId, committer: &Signature, message: &str) -> String {
    // Messages are single-line by construction; embedded newlines would
    // corrupt the log framing.
    let message = message.replace('\n', " ");
    format!(
        "{} {} {} <{}> {} {}\t{}\n",
        old.hex(),
        new.hex(),
        committer.name,
        committer.email,
        committer.when.millis_since_epoch,
        committer.when.tz_offset,
        message,
    )
}

fn parse_log_line(line: &str) -> Option<ReflogEntry> {
    let (head, message) = line.split_once('\t')?;
    let (old_hex, rest) = head.split_once(' ')?;
    let (new_hex, sig) = rest.split_once(' ')?;
    let old = ObjectId::try_from_hex(old_hex)?;
    let new = ObjectId::try_from_hex(new_hex)?;
    let open = sig.rfind('<')?;
    let close = sig[open..].find('>')? + open;
    let name = sig[..open].trim_end().to_owned();
    let email = sig[open + 1..close].to_owned();
    let mut tail = sig[close + 1..].trim_start().split(' ');
    let millis = tail.next()?.parse().ok()?;
    let tz_offset = tail.next()?.parse().ok()?;
    Some(ReflogEntry {
        old,
        new,
        committer: Signature {
            name,
            email,
            when: Timestamp {
                millis_since_epoch: millis,
                tz_offset,
            },
        },
        message: message.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use test_case::test_case;

    use super::*;

    fn new_refdb() -> (tempfile::TempDir, RefDb) {
        let dir = tempfile::tempdir().unwrap();
        let refdb = RefDb::init(dir.path()).unwrap();
        (dir, refdb)
    }

    fn signature() -> Signature {
        Signature {
            name: "Someone".to_owned(),
            email: "someone@example.com".to_owned(),
            when: Timestamp {
                millis_since_epoch: 1700000000000,
                tz_offset: 60,
            },
        }
    }

    fn branch(name: &str, target: ObjectId) -> Reference {
        Reference::Hash {
            name: format!("{BRANCH_PREFIX}{name}"),
            target,
        }
    }

    #[test]
    fn test_create_resolve_head() {
        let (_dir, refdb) = new_refdb();
        let target = ObjectId::hash_of(b"c0");
        refdb.update(&branch("main", target), None).unwrap();
        refdb
            .force_update(&Reference::Symbolic {
                name: HEAD_NAME.to_owned(),
                target: "refs/heads/main".to_owned(),
            })
            .unwrap();

        assert_matches!(refdb.head().unwrap(), Reference::Symbolic { .. });
        assert_eq!(refdb.current_branch().unwrap(), Some("main".to_owned()));
        let resolved = refdb.resolve(HEAD_NAME).unwrap();
        assert_eq!(resolved.hash_target(), Some(target));
        assert_eq!(resolved.name(), "refs/heads/main");
    }

    #[test]
    fn test_cas_update() {
        let (_dir, refdb) = new_refdb();
        let c0 = ObjectId::hash_of(b"c0");
        let c1 = ObjectId::hash_of(b"c1");

        // Creating requires expecting absence.
        refdb.update(&branch("main", c0), None).unwrap();
        assert_matches!(
            refdb.update(&branch("main", c1), None),
            Err(RefError::Precondition { .. })
        );

        // Advancing requires the correct old value.
        let old = branch("main", c0);
        refdb.update(&branch("main", c1), Some(&old)).unwrap();
        assert_matches!(
            refdb.update(&branch("main", c0), Some(&old)),
            Err(RefError::Precondition { .. })
        );
        assert_eq!(
            refdb.resolve("refs/heads/main").unwrap().hash_target(),
            Some(c1)
        );
    }

    #[test]
    fn test_remove() {
        let (_dir, refdb) = new_refdb();
        let reference = branch("topic/one", ObjectId::hash_of(b"c"));
        refdb.update(&reference, None).unwrap();
        refdb.remove(reference.name(), Some(&reference)).unwrap();
        assert_matches!(
            refdb.reference("refs/heads/topic/one"),
            Err(RefError::NotFound(_))
        );
        assert_matches!(
            refdb.remove("refs/heads/topic/one", None),
            Err(RefError::NotFound(_))
        );
    }

    #[test]
    fn test_prefix_match_collisions() {
        let (_dir, refdb) = new_refdb();
        refdb
            .update(&branch("foo", ObjectId::hash_of(b"c")), None)
            .unwrap();
        // "refs/heads/foo/bar" collides with existing "refs/heads/foo".
        let matches = refdb.prefix_match("refs/heads/foo/bar").unwrap();
        assert_eq!(matches, vec!["refs/heads/foo"]);
        // And the reverse direction.
        refdb
            .update(&branch("dir/nested", ObjectId::hash_of(b"c")), None)
            .unwrap();
        let matches = refdb.prefix_match("refs/heads/dir").unwrap();
        assert_eq!(matches, vec!["refs/heads/dir/nested"]);
        assert!(refdb.prefix_match("refs/heads/clean").unwrap().is_empty());
    }

    #[test]
    fn test_list() {
        let (_dir, refdb) = new_refdb();
        refdb
            .update(&branch("b", ObjectId::hash_of(b"1")), None)
            .unwrap();
        refdb
            .update(&branch("a", ObjectId::hash_of(b"2")), None)
            .unwrap();
        let names: Vec<String> = refdb
            .list(BRANCH_PREFIX)
            .unwrap()
            .into_iter()
            .map(|r| r.name().to_owned())
            .collect();
        assert_eq!(names, vec!["refs/heads/a", "refs/heads/b"]);
    }

    #[test]
    fn test_reflog_append_and_read() {
        let (_dir, refdb) = new_refdb();
        let c0 = ObjectId::hash_of(b"c0");
        let c1 = ObjectId::hash_of(b"c1");

        refdb
            .append_log("refs/heads/main", ObjectId::ZERO, c0, &signature(), "commit: init")
            .unwrap();
        refdb
            .append_log("refs/heads/main", c0, c1, &signature(), "commit: more")
            .unwrap();
        // A no-op move appends nothing.
        refdb
            .append_log("refs/heads/main", c1, c1, &signature(), "noop")
            .unwrap();

        let log = refdb.read_log("refs/heads/main").unwrap();
        assert_eq!(log.entries.len(), 2);
        assert_eq!(log.entries[0].old, ObjectId::ZERO);
        assert_eq!(log.entries[0].new, c0);
        assert_eq!(log.entries[0].message, "commit: init");
        assert_eq!(log.entries[1].committer, signature());

        // Rewriting without the first entry.
        let mut rewritten = log.clone();
        rewritten.entries.remove(0);
        refdb.write_log(&rewritten).unwrap();
        assert_eq!(refdb.read_log("refs/heads/main").unwrap(), rewritten);

        refdb.delete_log("refs/heads/main").unwrap();
        assert!(refdb.read_log("refs/heads/main").unwrap().entries.is_empty());
    }

    #[test]
    fn test_corrupt_reflog_is_an_error() {
        let (dir, refdb) = new_refdb();
        fs::create_dir_all(dir.path().join("logs/refs/heads")).unwrap();
        fs::write(dir.path().join("logs/refs/heads/main"), "not a log line\n").unwrap();
        assert_matches!(
            refdb.read_log("refs/heads/main"),
            Err(RefError::CorruptLog { line: 1, .. })
        );
        // The reference itself stays writable.
        refdb
            .update(&branch("main", ObjectId::hash_of(b"c")), None)
            .unwrap();
    }

    #[test_case("main", true)]
    #[test_case("feature/nested", true)]
    #[test_case("v1.2.3", true)]
    #[test_case("", false)]
    #[test_case("HEAD", false)]
    #[test_case("/leading", false)]
    #[test_case("trailing/", false)]
    #[test_case("dot.", false)]
    #[test_case("a..b", false ; "double_dot")]
    #[test_case("a//b", false ; "double_slash")]
    #[test_case(".hidden", false)]
    #[test_case("with space", false)]
    #[test_case("ctrl\u{7}char", false)]
    #[test_case("what^up", false)]
    #[test_case("ref.lock", false)]
    fn test_validate_branch_name(name: &str, ok: bool) {
        assert_eq!(validate_branch_name(name).is_ok(), ok);
    }
}
