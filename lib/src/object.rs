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

//! The content-addressed object model: commits, trees, blobs, tags and
//! fragment manifests, plus their canonical serialized forms.
//!
//! An object's id is the hash of `"<kind> <len>\0"` followed by the body.
//! Folding the kind into the hashed bytes keeps ids of different kinds in
//! disjoint domains, so a Fragments manifest can never collide with the blob
//! whose content it describes.

use std::fmt;
use std::str::FromStr;

use chrono::TimeZone as _;
use smallvec::SmallVec;
use thiserror::Error;

use crate::hash::HASH_LEN;
use crate::hash::ObjectId;

/// Tag identifying the serialized form of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
    Fragments,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
            Self::Fragments => "fragments",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = ObjectCodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(Self::Commit),
            "tree" => Ok(Self::Tree),
            "blob" => Ok(Self::Blob),
            "tag" => Ok(Self::Tag),
            "fragments" => Ok(Self::Fragments),
            _ => Err(ObjectCodecError::UnknownKind(s.to_owned())),
        }
    }
}

/// Error from decoding a canonical object form.
#[derive(Debug, Error)]
pub enum ObjectCodecError {
    #[error("Unknown object kind {0:?}")]
    UnknownKind(String),
    #[error("Malformed {kind} object: {reason}")]
    Malformed { kind: &'static str, reason: String },
    #[error("Malformed file mode {0:o}")]
    BadMode(u32),
}

fn malformed(kind: &'static str, reason: impl Into<String>) -> ObjectCodecError {
    ObjectCodecError::Malformed {
        kind,
        reason: reason.into(),
    }
}

/// File mode of a tree entry. The type bits follow the traditional layout
/// (directory, regular, executable, symlink); [`FileMode::FRAGMENTS`] is an
/// orthogonal flag marking content stored as a fragment manifest rather than
/// a single blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileMode(u32);

impl FileMode {
    pub const DIR: Self = Self(0o040000);
    pub const REGULAR: Self = Self(0o100644);
    pub const EXECUTABLE: Self = Self(0o100755);
    pub const SYMLINK: Self = Self(0o120000);
    /// Orthogonal flag: content is a Fragments manifest.
    pub const FRAGMENTS: Self = Self(0o200000);

    const TYPE_MASK: u32 = 0o170000;

    pub fn from_raw(raw: u32) -> Result<Self, ObjectCodecError> {
        let mode = Self(raw);
        let base = Self(raw & !Self::FRAGMENTS.0);
        match base {
            Self::DIR | Self::REGULAR | Self::EXECUTABLE | Self::SYMLINK => {
                if mode.is_fragments() && !base.is_file() {
                    Err(ObjectCodecError::BadMode(raw))
                } else {
                    Ok(mode)
                }
            }
            _ => Err(ObjectCodecError::BadMode(raw)),
        }
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn is_dir(&self) -> bool {
        self.0 & Self::TYPE_MASK == Self::DIR.0
    }

    pub fn is_symlink(&self) -> bool {
        self.0 & Self::TYPE_MASK == Self::SYMLINK.0
    }

    /// Regular or executable file, fragmented or not.
    pub fn is_file(&self) -> bool {
        self.0 & Self::TYPE_MASK == 0o100000
    }

    pub fn is_executable(&self) -> bool {
        self.is_file() && self.0 & 0o111 != 0
    }

    pub fn is_fragments(&self) -> bool {
        self.0 & Self::FRAGMENTS.0 != 0
    }

    pub fn with_fragments(self) -> Self {
        Self(self.0 | Self::FRAGMENTS.0)
    }

    /// The permission part of the mode, with the fragments flag cleared.
    pub fn without_fragments(self) -> Self {
        Self(self.0 & !Self::FRAGMENTS.0)
    }
}

impl fmt::Debug for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileMode({:o})", self.0)
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:o}", self.0)
    }
}

/// Point in time with the author's UTC offset, millisecond precision.
#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Timestamp {
    pub millis_since_epoch: i64,
    /// Time zone offset in minutes east of UTC.
    pub tz_offset: i32,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(chrono::offset::Local::now())
    }

    pub fn from_datetime<Tz: chrono::TimeZone<Offset = chrono::offset::FixedOffset>>(
        datetime: chrono::DateTime<Tz>,
    ) -> Self {
        Self {
            millis_since_epoch: datetime.timestamp_millis(),
            tz_offset: datetime.offset().local_minus_utc() / 60,
        }
    }

    pub fn to_datetime(&self) -> Option<chrono::DateTime<chrono::FixedOffset>> {
        let utc = match chrono::Utc.timestamp_opt(
            self.millis_since_epoch.div_euclid(1000),
            (self.millis_since_epoch.rem_euclid(1000)) as u32 * 1000000,
        ) {
            chrono::LocalResult::None => return None,
            chrono::LocalResult::Single(x) => x,
            chrono::LocalResult::Ambiguous(y, _z) => y,
        };
        let tz = chrono::FixedOffset::east_opt(self.tz_offset * 60)
            .unwrap_or_else(|| chrono::FixedOffset::east_opt(0).unwrap());
        Some(utc.with_timezone(&tz))
    }
}

/// Author or committer identity attached to commits, tags and reflog
/// entries.
#[derive(Debug, PartialEq, Eq, Clone, serde::Serialize, serde::Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub when: Timestamp,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: SmallVec<[ObjectId; 2]>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
    /// Single-line headers preserved verbatim, e.g. a signing envelope.
    pub extra_headers: Vec<(String, String)>,
}

impl Commit {
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// First line of the message.
    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }
}

/// Annotated tag object.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Tag {
    pub object: ObjectId,
    pub object_kind: ObjectKind,
    pub name: String,
    pub tagger: Signature,
    pub content: String,
}

/// One chunk of a fragmented blob.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FragmentEntry {
    pub index: u32,
    pub hash: ObjectId,
    pub size: u64,
}

/// Manifest of a large blob split into ordered chunks.
///
/// `origin` is the blob hash of the raw pre-split bytes and serves as the
/// logical identity of the file content.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Fragments {
    pub size: u64,
    pub origin: ObjectId,
    pub entries: Vec<FragmentEntry>,
}

impl Fragments {
    /// Checks the manifest invariants: indices are `0..N-1` and chunk sizes
    /// sum to the total size.
    pub fn validate(&self) -> Result<(), ObjectCodecError> {
        let mut total = 0u64;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.index as usize != i {
                return Err(malformed(
                    "fragments",
                    format!("chunk index {} at position {i}", entry.index),
                ));
            }
            total = total
                .checked_add(entry.size)
                .ok_or_else(|| malformed("fragments", "chunk sizes overflow"))?;
        }
        if total != self.size {
            return Err(malformed(
                "fragments",
                format!("chunk sizes sum to {total}, manifest says {}", self.size),
            ));
        }
        Ok(())
    }
}

/// Entry in a tree, pointing at a blob, fragment manifest or subtree.
///
/// `size` is the logical content size for files and 0 for directories. For
/// fragmented files it is the origin size, not the manifest size.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TreeEntry {
    pub name: String,
    pub mode: FileMode,
    pub hash: ObjectId,
    pub size: u64,
}

impl TreeEntry {
    pub fn new(name: impl Into<String>, mode: FileMode, hash: ObjectId, size: u64) -> Self {
        Self {
            name: name.into(),
            mode,
            hash,
            size,
        }
    }
}

/// Compares entry names in subtree order: directory names sort as if they
/// were suffixed with `/`.
pub fn cmp_tree_entry_names(a: &str, a_is_dir: bool, b: &str, b_is_dir: bool) -> std::cmp::Ordering {
    let key = |name: &str, is_dir: bool| {
        name.bytes()
            .chain(is_dir.then_some(b'/'))
            .collect::<Vec<u8>>()
    };
    key(a, a_is_dir).cmp(&key(b, b_is_dir))
}

/// Ordered list of tree entries in canonical subtree order.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// Builds a tree, sorting the entries into canonical order. The tree
    /// hash is therefore invariant under input ordering.
    pub fn from_entries(mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(|a, b| {
            cmp_tree_entry_names(&a.name, a.mode.is_dir(), &b.name, b.mode.is_dir())
        });
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl ExactSizeIterator<Item = &TreeEntry> {
        self.entries.iter()
    }

    pub fn entry(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn into_entries(self) -> Vec<TreeEntry> {
        self.entries
    }
}

/// A decoded metadata object. Blob content is streamed, never decoded into
/// this type.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Object {
    Commit(Commit),
    Tree(Tree),
    Tag(Tag),
    Fragments(Fragments),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Commit(_) => ObjectKind::Commit,
            Self::Tree(_) => ObjectKind::Tree,
            Self::Tag(_) => ObjectKind::Tag,
            Self::Fragments(_) => ObjectKind::Fragments,
        }
    }
}

/// Formats the `"<kind> <len>\0"` header that prefixes every hashed form.
pub fn object_header(kind: ObjectKind, body_len: usize) -> Vec<u8> {
    format!("{kind} {body_len}\0").into_bytes()
}

/// Computes the id of an object given its kind and canonical body.
pub fn object_id_of(kind: ObjectKind, body: &[u8]) -> ObjectId {
    let mut data = object_header(kind, body.len());
    data.extend_from_slice(body);
    ObjectId::hash_of(&data)
}

/// Canonical-encodes `object` into its body form (header not included).
pub fn encode_body(object: &Object) -> Vec<u8> {
    match object {
        Object::Commit(commit) => encode_commit(commit),
        Object::Tree(tree) => encode_tree(tree),
        Object::Tag(tag) => encode_tag(tag),
        Object::Fragments(fragments) => encode_fragments(fragments),
    }
}

/// Decodes the body form of a metadata object. `Blob` is not a decodable
/// kind; blob content is raw bytes.
pub fn decode_body(kind: ObjectKind, body: &[u8]) -> Result<Object, ObjectCodecError> {
    match kind {
        ObjectKind::Commit => decode_commit(body).map(Object::Commit),
        ObjectKind::Tree => decode_tree(body).map(Object::Tree),
        ObjectKind::Tag => decode_tag(body).map(Object::Tag),
        ObjectKind::Fragments => decode_fragments(body).map(Object::Fragments),
        ObjectKind::Blob => Err(malformed("blob", "blob bodies are not decoded")),
    }
}

fn write_signature(out: &mut Vec<u8>, key: &str, sig: &Signature) {
    out.extend_from_slice(
        format!(
            "{key} {} <{}> {} {}\n",
            sig.name, sig.email, sig.when.millis_since_epoch, sig.when.tz_offset
        )
        .as_bytes(),
    );
}

fn parse_signature(kind: &'static str, value: &str) -> Result<Signature, ObjectCodecError> {
    let open = value
        .rfind('<')
        .ok_or_else(|| malformed(kind, "signature without <email>"))?;
    let close = value[open..]
        .find('>')
        .map(|i| open + i)
        .ok_or_else(|| malformed(kind, "signature without <email>"))?;
    let name = value[..open].trim_end().to_owned();
    let email = value[open + 1..close].to_owned();
    let rest = value[close + 1..].trim_start();
    let mut parts = rest.split(' ');
    let millis = parts
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| malformed(kind, "signature without timestamp"))?;
    let tz_offset = parts
        .next()
        .and_then(|s| s.parse::<i32>().ok())
        .ok_or_else(|| malformed(kind, "signature without tz offset"))?;
    if parts.next().is_some() {
        return Err(malformed(kind, "trailing data after signature"));
    }
    Ok(Signature {
        name,
        email,
        when: Timestamp {
            millis_since_epoch: millis,
            tz_offset,
        },
    })
}

fn encode_commit(commit: &Commit) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("tree {}\n", commit.tree.hex()).as_bytes());
    for parent in &commit.parents {
        out.extend_from_slice(format!("parent {}\n", parent.hex()).as_bytes());
    }
    write_signature(&mut out, "author", &commit.author);
    write_signature(&mut out, "committer", &commit.committer);
    for (key, value) in &commit.extra_headers {
        out.extend_from_slice(format!("{key} {value}\n").as_bytes());
    }
    out.push(b'\n');
    out.extend_from_slice(commit.message.as_bytes());
    out
}

fn split_headers(kind: &'static str, body: &[u8]) -> Result<(Vec<(String, String)>, String), ObjectCodecError> {
    let text = std::str::from_utf8(body).map_err(|_| malformed(kind, "not valid UTF-8"))?;
    let (headers, message) = text
        .split_once("\n\n")
        .ok_or_else(|| malformed(kind, "missing header/message separator"))?;
    let mut parsed = Vec::new();
    for line in headers.split('\n') {
        let (key, value) = line
            .split_once(' ')
            .ok_or_else(|| malformed(kind, format!("bad header line {line:?}")))?;
        parsed.push((key.to_owned(), value.to_owned()));
    }
    Ok((parsed, message.to_owned()))
}

fn parse_id(kind: &'static str, value: &str) -> Result<ObjectId, ObjectCodecError> {
    ObjectId::try_from_hex(value).ok_or_else(|| malformed(kind, format!("bad object id {value:?}")))
}

fn decode_commit(body: &[u8]) -> Result<Commit, ObjectCodecError> {
    let (headers, message) = split_headers("commit", body)?;
    let mut headers = headers.into_iter();
    let (key, value) = headers
        .next()
        .ok_or_else(|| malformed("commit", "empty header block"))?;
    if key != "tree" {
        return Err(malformed("commit", "first header must be tree"));
    }
    let tree = parse_id("commit", &value)?;
    let mut parents = SmallVec::new();
    let mut author = None;
    let mut committer = None;
    let mut extra_headers = Vec::new();
    for (key, value) in headers {
        match key.as_str() {
            "parent" if author.is_none() => parents.push(parse_id("commit", &value)?),
            "author" => author = Some(parse_signature("commit", &value)?),
            "committer" => committer = Some(parse_signature("commit", &value)?),
            _ => extra_headers.push((key, value)),
        }
    }
    Ok(Commit {
        tree,
        parents,
        author: author.ok_or_else(|| malformed("commit", "missing author"))?,
        committer: committer.ok_or_else(|| malformed("commit", "missing committer"))?,
        message,
        extra_headers,
    })
}

fn encode_tag(tag: &Tag) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("object {}\n", tag.object.hex()).as_bytes());
    out.extend_from_slice(format!("type {}\n", tag.object_kind).as_bytes());
    out.extend_from_slice(format!("tag {}\n", tag.name).as_bytes());
    write_signature(&mut out, "tagger", &tag.tagger);
    out.push(b'\n');
    out.extend_from_slice(tag.content.as_bytes());
    out
}

fn decode_tag(body: &[u8]) -> Result<Tag, ObjectCodecError> {
    let (headers, content) = split_headers("tag", body)?;
    let mut object = None;
    let mut object_kind = None;
    let mut name = None;
    let mut tagger = None;
    for (key, value) in headers {
        match key.as_str() {
            "object" => object = Some(parse_id("tag", &value)?),
            "type" => object_kind = Some(value.parse()?),
            "tag" => name = Some(value),
            "tagger" => tagger = Some(parse_signature("tag", &value)?),
            _ => return Err(malformed("tag", format!("unknown header {key:?}"))),
        }
    }
    Ok(Tag {
        object: object.ok_or_else(|| malformed("tag", "missing object"))?,
        object_kind: object_kind.ok_or_else(|| malformed("tag", "missing type"))?,
        name: name.ok_or_else(|| malformed("tag", "missing tag name"))?,
        tagger: tagger.ok_or_else(|| malformed("tag", "missing tagger"))?,
        content,
    })
}

fn encode_fragments(fragments: &Fragments) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("size {}\n", fragments.size).as_bytes());
    out.extend_from_slice(format!("origin {}\n", fragments.origin.hex()).as_bytes());
    for entry in &fragments.entries {
        out.extend_from_slice(
            format!("chunk {} {} {}\n", entry.index, entry.hash.hex(), entry.size).as_bytes(),
        );
    }
    out
}

fn decode_fragments(body: &[u8]) -> Result<Fragments, ObjectCodecError> {
    let text =
        std::str::from_utf8(body).map_err(|_| malformed("fragments", "not valid UTF-8"))?;
    let mut lines = text.lines();
    let size = lines
        .next()
        .and_then(|line| line.strip_prefix("size "))
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| malformed("fragments", "missing size"))?;
    let origin = lines
        .next()
        .and_then(|line| line.strip_prefix("origin "))
        .map(|s| parse_id("fragments", s))
        .transpose()?
        .ok_or_else(|| malformed("fragments", "missing origin"))?;
    let mut entries = Vec::new();
    for line in lines {
        let rest = line
            .strip_prefix("chunk ")
            .ok_or_else(|| malformed("fragments", format!("bad line {line:?}")))?;
        let mut parts = rest.split(' ');
        let (Some(index), Some(hash), Some(size), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed("fragments", format!("bad chunk line {line:?}")));
        };
        entries.push(FragmentEntry {
            index: index
                .parse()
                .map_err(|_| malformed("fragments", "bad chunk index"))?,
            hash: parse_id("fragments", hash)?,
            size: size
                .parse()
                .map_err(|_| malformed("fragments", "bad chunk size"))?,
        });
    }
    let fragments = Fragments {
        size,
        origin,
        entries,
    };
    fragments.validate()?;
    Ok(fragments)
}

fn encode_tree(tree: &Tree) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in tree.entries() {
        out.extend_from_slice(format!("{:o} {}\0", entry.mode.raw(), entry.name).as_bytes());
        out.extend_from_slice(entry.hash.as_bytes());
        out.extend_from_slice(&entry.size.to_be_bytes());
    }
    out
}

fn decode_tree(body: &[u8]) -> Result<Tree, ObjectCodecError> {
    let mut entries = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| malformed("tree", "truncated entry"))?;
        let head = std::str::from_utf8(&rest[..nul])
            .map_err(|_| malformed("tree", "entry name not valid UTF-8"))?;
        let (mode_str, name) = head
            .split_once(' ')
            .ok_or_else(|| malformed("tree", "entry without mode"))?;
        let raw_mode = u32::from_str_radix(mode_str, 8)
            .map_err(|_| malformed("tree", format!("bad mode {mode_str:?}")))?;
        let mode = FileMode::from_raw(raw_mode)?;
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(malformed("tree", format!("bad entry name {name:?}")));
        }
        rest = &rest[nul + 1..];
        if rest.len() < HASH_LEN + 8 {
            return Err(malformed("tree", "truncated entry payload"));
        }
        let hash = ObjectId::try_from_bytes(&rest[..HASH_LEN]).unwrap();
        let size = u64::from_be_bytes(rest[HASH_LEN..HASH_LEN + 8].try_into().unwrap());
        rest = &rest[HASH_LEN + 8..];
        entries.push(TreeEntry {
            name: name.to_owned(),
            mode,
            hash,
            size,
        });
    }
    // Serialized trees must already be in canonical order.
    let sorted = Tree::from_entries(entries.clone());
    if sorted.entries != entries {
        return Err(malformed("tree", "entries not in canonical order"));
    }
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_signature() -> Signature {
        Signature {
            name: "Someone".to_owned(),
            email: "someone@example.com".to_owned(),
            when: Timestamp {
                millis_since_epoch: 1700000000000,
                tz_offset: -480,
            },
        }
    }

    fn some_commit() -> Commit {
        Commit {
            tree: ObjectId::hash_of(b"tree"),
            parents: [ObjectId::hash_of(b"p1"), ObjectId::hash_of(b"p2")].into(),
            author: some_signature(),
            committer: some_signature(),
            message: "subject line\n\nbody\n".to_owned(),
            extra_headers: vec![("x-zeta".to_owned(), "1".to_owned())],
        }
    }

    #[test]
    fn test_commit_round_trip() {
        let commit = some_commit();
        let body = encode_commit(&commit);
        let decoded = decode_commit(&body).unwrap();
        assert_eq!(decoded, commit);
        assert_eq!(encode_commit(&decoded), body);
        assert_eq!(commit.subject(), "subject line");
        assert!(commit.is_merge());
    }

    #[test]
    fn test_signature_with_spaces_in_name() {
        let mut commit = some_commit();
        commit.author.name = "Some One Else".to_owned();
        let decoded = decode_commit(&encode_commit(&commit)).unwrap();
        assert_eq!(decoded.author.name, "Some One Else");
    }

    #[test]
    fn test_tag_round_trip() {
        let tag = Tag {
            object: ObjectId::hash_of(b"c"),
            object_kind: ObjectKind::Commit,
            name: "v1.0".to_owned(),
            tagger: some_signature(),
            content: "release\n".to_owned(),
        };
        let body = encode_tag(&tag);
        assert_eq!(decode_tag(&body).unwrap(), tag);
    }

    #[test]
    fn test_fragments_round_trip_and_validate() {
        let fragments = Fragments {
            size: 10,
            origin: ObjectId::hash_of(b"whole"),
            entries: vec![
                FragmentEntry {
                    index: 0,
                    hash: ObjectId::hash_of(b"a"),
                    size: 6,
                },
                FragmentEntry {
                    index: 1,
                    hash: ObjectId::hash_of(b"b"),
                    size: 4,
                },
            ],
        };
        let body = encode_fragments(&fragments);
        assert_eq!(decode_fragments(&body).unwrap(), fragments);

        let mut bad = fragments.clone();
        bad.size = 11;
        assert!(bad.validate().is_err());
        let mut bad = fragments;
        bad.entries[1].index = 2;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_tree_order_canonicalization() {
        let file = |name: &str| TreeEntry::new(name, FileMode::REGULAR, ObjectId::hash_of(b"f"), 1);
        let dir = |name: &str| TreeEntry::new(name, FileMode::DIR, ObjectId::hash_of(b"d"), 0);

        // "foo" as a directory sorts after "foo.txt" because it compares as
        // "foo/".
        let a = Tree::from_entries(vec![file("foo.txt"), dir("foo"), file("bar")]);
        let b = Tree::from_entries(vec![dir("foo"), file("bar"), file("foo.txt")]);
        assert_eq!(a, b);
        assert_eq!(
            a.entries().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            vec!["bar", "foo.txt", "foo"]
        );
        assert_eq!(encode_tree(&a), encode_tree(&b));
        assert_eq!(
            object_id_of(ObjectKind::Tree, &encode_tree(&a)),
            object_id_of(ObjectKind::Tree, &encode_tree(&b))
        );
    }

    #[test]
    fn test_tree_round_trip() {
        let tree = Tree::from_entries(vec![
            TreeEntry::new("a.txt", FileMode::REGULAR, ObjectId::hash_of(b"a"), 3),
            TreeEntry::new(
                "big.bin",
                FileMode::REGULAR.with_fragments(),
                ObjectId::hash_of(b"m"),
                1 << 30,
            ),
            TreeEntry::new("sub", FileMode::DIR, ObjectId::hash_of(b"t"), 0),
        ]);
        let body = encode_tree(&tree);
        assert_eq!(decode_tree(&body).unwrap(), tree);
    }

    #[test]
    fn test_decode_tree_rejects_unsorted() {
        let tree = Tree::from_entries(vec![
            TreeEntry::new("b", FileMode::REGULAR, ObjectId::hash_of(b"b"), 1),
            TreeEntry::new("a", FileMode::REGULAR, ObjectId::hash_of(b"a"), 1),
        ]);
        let mut entries: Vec<_> = tree.entries().cloned().collect();
        entries.reverse();
        let reversed = Tree { entries };
        let body = encode_tree(&reversed);
        assert!(decode_tree(&body).is_err());
    }

    #[test]
    fn test_kind_header_domain_separation() {
        // The same body hashed under different kinds yields different ids.
        let body = b"size 0\n";
        assert_ne!(
            object_id_of(ObjectKind::Blob, body),
            object_id_of(ObjectKind::Fragments, body)
        );
    }

    #[test]
    fn test_mode_flags() {
        assert!(FileMode::DIR.is_dir());
        assert!(FileMode::REGULAR.is_file());
        assert!(!FileMode::REGULAR.is_executable());
        assert!(FileMode::EXECUTABLE.is_executable());
        assert!(FileMode::SYMLINK.is_symlink());
        let frag = FileMode::EXECUTABLE.with_fragments();
        assert!(frag.is_fragments() && frag.is_executable() && frag.is_file());
        assert_eq!(frag.without_fragments(), FileMode::EXECUTABLE);
        assert!(FileMode::from_raw(frag.raw()).is_ok());
        assert!(FileMode::from_raw(0o040000 | 0o200000).is_err());
        assert!(FileMode::from_raw(0o777777).is_err());
    }
}
