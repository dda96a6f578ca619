//! Hierarchical directory namespace
//!
//! Entries live in an arena indexed by [`EntryId`]; the parent link is a
//! non-owning index, so the tree has no ownership cycles and serializes
//! directly with serde. Children are kept in insertion order. The root entry
//! always exists and is never removable.

use crate::error::{FsError, Result};
use crate::fat::CHAIN_END;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum entry name length in bytes
pub const MAX_NAME_LEN: usize = 255;

/// Handle into the directory arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(u32);

impl EntryId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// A single file or directory entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Name, unique within the parent
    pub name: String,

    pub kind: EntryKind,

    /// Exact content size in bytes (files; directories report 0)
    pub size: u64,

    /// Creation timestamp (Unix epoch seconds)
    pub created_at: u64,

    /// Last modification timestamp (Unix epoch seconds)
    pub modified_at: u64,

    /// Protected entries reject rename, removal, and content rewrite
    pub protected: bool,

    /// Content digest (files only)
    pub content_hash: Option<[u8; 32]>,

    /// First block of the content chain, CHAIN_END if empty
    pub start_block: i64,

    /// Non-owning parent link; None only for the root
    pub parent: Option<EntryId>,

    /// Child entries in insertion order (directories only)
    pub children: Vec<EntryId>,
}

impl Entry {
    pub fn file(name: impl Into<String>, size: u64, hash: [u8; 32], start_block: i64) -> Self {
        let now = now_secs();
        Entry {
            name: name.into(),
            kind: EntryKind::File,
            size,
            created_at: now,
            modified_at: now,
            protected: false,
            content_hash: Some(hash),
            start_block,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        let now = now_secs();
        Entry {
            name: name.into(),
            kind: EntryKind::Directory,
            size: 0,
            created_at: now,
            modified_at: now,
            protected: false,
            content_hash: None,
            start_block: CHAIN_END,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn touch(&mut self) {
        self.modified_at = now_secs();
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Reject names that cannot live in a directory
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::Config(format!("invalid entry name: {:?}", name)));
    }
    if name.contains('/') {
        return Err(FsError::Config(format!(
            "entry name may not contain '/': {:?}",
            name
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::Config(format!(
            "entry name longer than {} bytes",
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

/// Arena-backed directory tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirTree {
    entries: Vec<Option<Entry>>,
    root: EntryId,
}

impl DirTree {
    /// Create a tree holding only the root directory
    pub fn new() -> Self {
        let mut root = Entry::directory("/");
        root.parent = None;
        DirTree {
            entries: vec![Some(root)],
            root: EntryId(0),
        }
    }

    pub fn root(&self) -> EntryId {
        self.root
    }

    /// Borrow an entry. Ids are only handed out by this tree; a stale id is a
    /// logic error, not a recoverable condition.
    pub fn entry(&self, id: EntryId) -> &Entry {
        self.entries[id.index()]
            .as_ref()
            .expect("stale entry id")
    }

    pub fn entry_mut(&mut self, id: EntryId) -> &mut Entry {
        self.entries[id.index()]
            .as_mut()
            .expect("stale entry id")
    }

    /// Iterate over all live entries
    pub fn entries(&self) -> impl Iterator<Item = (EntryId, &Entry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|e| (EntryId(i as u32), e)))
    }

    /// Number of live entries (root included)
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        false // the root always exists
    }

    fn child_by_name(&self, parent: EntryId, name: &str) -> Option<EntryId> {
        self.entry(parent)
            .children
            .iter()
            .copied()
            .find(|&c| self.entry(c).name == name)
    }

    /// Resolve a `/`-separated path relative to `base`
    ///
    /// Absolute paths resolve from the root. `.` and `..` are supported;
    /// `..` at the root stays at the root.
    pub fn resolve(&self, base: EntryId, path: &str) -> Result<EntryId> {
        let mut current = if path.starts_with('/') {
            self.root
        } else {
            base
        };

        for comp in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if comp == ".." {
                current = self.entry(current).parent.unwrap_or(self.root);
                continue;
            }
            if !self.entry(current).is_directory() {
                return Err(FsError::NotADirectory(self.full_path(current)));
            }
            current = self
                .child_by_name(current, comp)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        }
        Ok(current)
    }

    /// Split a target path into its parent directory and leaf name
    pub fn resolve_parent(&self, base: EntryId, path: &str) -> Result<(EntryId, String)> {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(FsError::Config(format!("invalid target path: {:?}", path)));
        }
        match trimmed.rsplit_once('/') {
            Some((dir, name)) => {
                let parent = if dir.is_empty() {
                    self.root
                } else {
                    self.resolve(base, dir)?
                };
                Ok((parent, name.to_string()))
            }
            None => Ok((base, trimmed.to_string())),
        }
    }

    /// Insert an entry under `parent`
    pub fn insert(&mut self, parent: EntryId, mut entry: Entry) -> Result<EntryId> {
        validate_name(&entry.name)?;
        {
            let p = self.entry(parent);
            if !p.is_directory() {
                return Err(FsError::NotADirectory(self.full_path(parent)));
            }
        }
        if self.child_by_name(parent, &entry.name).is_some() {
            return Err(FsError::DuplicateName(self.join(parent, &entry.name)));
        }

        entry.parent = Some(parent);
        let id = self.alloc_slot(entry);
        let p = self.entry_mut(parent);
        p.children.push(id);
        p.touch();
        Ok(id)
    }

    /// Remove an entry, returning the content chains of every removed file
    ///
    /// Directory removal requires `recursive` when children exist; recursive
    /// removal visits children before parents. Protection anywhere in the
    /// subtree blocks the whole operation before anything is detached.
    pub fn remove(&mut self, id: EntryId, recursive: bool) -> Result<Vec<i64>> {
        if id == self.root {
            return Err(FsError::Config("cannot remove the root directory".into()));
        }
        self.check_unprotected(id)?;

        let entry = self.entry(id);
        if entry.is_directory() && !entry.children.is_empty() && !recursive {
            return Err(FsError::DirectoryNotEmpty(self.full_path(id)));
        }

        if let Some(parent) = self.entry(id).parent {
            let p = self.entry_mut(parent);
            p.children.retain(|&c| c != id);
            p.touch();
        }

        let mut chains = Vec::new();
        for victim in self.post_order(id) {
            let entry = self.entries[victim.index()]
                .take()
                .expect("stale entry id");
            if entry.is_file() && entry.start_block != CHAIN_END {
                chains.push(entry.start_block);
            }
        }
        Ok(chains)
    }

    /// Rename or move an entry
    ///
    /// `target` is either a bare name (rename in place) or a path; a path
    /// naming an existing directory moves the entry into it keeping its name.
    pub fn rename(&mut self, base: EntryId, id: EntryId, target: &str) -> Result<()> {
        if id == self.root {
            return Err(FsError::Config("cannot rename the root directory".into()));
        }
        if self.entry(id).protected {
            return Err(FsError::Protected(self.full_path(id)));
        }

        let (new_parent, new_name) = if target.contains('/') {
            match self.resolve(base, target) {
                Ok(dest) if self.entry(dest).is_directory() => {
                    (dest, self.entry(id).name.clone())
                }
                _ => self.resolve_parent(base, target)?,
            }
        } else {
            (self.entry(id).parent.unwrap_or(self.root), target.to_string())
        };

        validate_name(&new_name)?;
        if !self.entry(new_parent).is_directory() {
            return Err(FsError::NotADirectory(self.full_path(new_parent)));
        }

        // Moving a directory under itself would detach the subtree.
        let mut cursor = Some(new_parent);
        while let Some(c) = cursor {
            if c == id {
                return Err(FsError::Config(format!(
                    "cannot move {} into its own subtree",
                    self.full_path(id)
                )));
            }
            cursor = self.entry(c).parent;
        }

        if let Some(existing) = self.child_by_name(new_parent, &new_name) {
            if existing != id {
                return Err(FsError::DuplicateName(self.join(new_parent, &new_name)));
            }
        }

        let old_parent = self.entry(id).parent.unwrap_or(self.root);
        if old_parent != new_parent {
            self.entry_mut(old_parent).children.retain(|&c| c != id);
            self.entry_mut(old_parent).touch();
            self.entry_mut(new_parent).children.push(id);
            self.entry_mut(new_parent).touch();
            self.entry_mut(id).parent = Some(new_parent);
        }
        let entry = self.entry_mut(id);
        entry.name = new_name;
        entry.touch();
        Ok(())
    }

    /// Immediate children in insertion order
    pub fn list(&self, id: EntryId) -> Result<Vec<EntryId>> {
        let entry = self.entry(id);
        if !entry.is_directory() {
            return Err(FsError::NotADirectory(self.full_path(id)));
        }
        Ok(entry.children.clone())
    }

    /// Absolute path of an entry, reconstructed from parent links
    pub fn full_path(&self, id: EntryId) -> String {
        if id == self.root {
            return "/".to_string();
        }
        let mut parts = Vec::new();
        let mut cursor = id;
        while cursor != self.root {
            let entry = self.entry(cursor);
            parts.push(entry.name.clone());
            cursor = entry.parent.unwrap_or(self.root);
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    fn join(&self, parent: EntryId, name: &str) -> String {
        if parent == self.root {
            format!("/{}", name)
        } else {
            format!("{}/{}", self.full_path(parent), name)
        }
    }

    fn alloc_slot(&mut self, entry: Entry) -> EntryId {
        for (i, slot) in self.entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return EntryId(i as u32);
            }
        }
        self.entries.push(Some(entry));
        EntryId((self.entries.len() - 1) as u32)
    }

    fn check_unprotected(&self, id: EntryId) -> Result<()> {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let entry = self.entry(current);
            if entry.protected {
                return Err(FsError::Protected(self.full_path(current)));
            }
            stack.extend(entry.children.iter().copied());
        }
        Ok(())
    }

    /// Subtree ids with children before their parents
    fn post_order(&self, id: EntryId) -> Vec<EntryId> {
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            order.push(current);
            stack.extend(self.entry(current).children.iter().copied());
        }
        order.reverse();
        order
    }

    /// Structural validation after deserialization
    ///
    /// Checks the root, parent/child backlinks, name uniqueness, and that
    /// only directories carry children and only files carry content.
    pub fn validate(&self) -> Result<()> {
        let root = self
            .entries
            .get(self.root.index())
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| FsError::CorruptFilesystem("missing root directory entry".into()))?;
        if !root.is_directory() || root.parent.is_some() {
            return Err(FsError::CorruptFilesystem(
                "root entry is not a parentless directory".into(),
            ));
        }

        for (id, entry) in self.entries() {
            if id != self.root {
                let parent = entry.parent.ok_or_else(|| {
                    FsError::CorruptFilesystem(format!("entry {:?} has no parent", entry.name))
                })?;
                let p = self
                    .entries
                    .get(parent.index())
                    .and_then(|slot| slot.as_ref())
                    .ok_or_else(|| {
                        FsError::CorruptFilesystem(format!(
                            "entry {:?} points at a missing parent",
                            entry.name
                        ))
                    })?;
                if !p.is_directory() || !p.children.contains(&id) {
                    return Err(FsError::CorruptFilesystem(format!(
                        "entry {:?} not linked from its parent",
                        entry.name
                    )));
                }
            }

            match entry.kind {
                EntryKind::Directory => {
                    if entry.start_block != CHAIN_END || entry.content_hash.is_some() {
                        return Err(FsError::CorruptFilesystem(format!(
                            "directory {:?} carries file content",
                            entry.name
                        )));
                    }
                    let mut names = HashSet::new();
                    for &child in &entry.children {
                        let c = self
                            .entries
                            .get(child.index())
                            .and_then(|slot| slot.as_ref())
                            .ok_or_else(|| {
                                FsError::CorruptFilesystem(format!(
                                    "directory {:?} lists a missing child",
                                    entry.name
                                ))
                            })?;
                        if c.parent != Some(id) {
                            return Err(FsError::CorruptFilesystem(format!(
                                "child {:?} parent backlink mismatch",
                                c.name
                            )));
                        }
                        if !names.insert(c.name.as_str()) {
                            return Err(FsError::CorruptFilesystem(format!(
                                "duplicate name {:?} in {:?}",
                                c.name, entry.name
                            )));
                        }
                    }
                }
                EntryKind::File => {
                    if !entry.children.is_empty() {
                        return Err(FsError::CorruptFilesystem(format!(
                            "file {:?} has children",
                            entry.name
                        )));
                    }
                    if entry.content_hash.is_none() {
                        return Err(FsError::CorruptFilesystem(format!(
                            "file {:?} missing content hash",
                            entry.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for DirTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hash() -> [u8; 32] {
        [0xAB; 32]
    }

    #[test]
    fn test_root_exists() {
        let tree = DirTree::new();
        let root = tree.entry(tree.root());
        assert!(root.is_directory());
        assert!(root.parent.is_none());
        assert_eq!(tree.full_path(tree.root()), "/");
    }

    #[test]
    fn test_insert_and_resolve() {
        let mut tree = DirTree::new();
        let docs = tree.insert(tree.root(), Entry::directory("docs")).unwrap();
        let file = tree
            .insert(docs, Entry::file("a.txt", 10, sample_hash(), 1))
            .unwrap();

        assert_eq!(tree.resolve(tree.root(), "/docs/a.txt").unwrap(), file);
        assert_eq!(tree.resolve(docs, "a.txt").unwrap(), file);
        assert_eq!(tree.resolve(docs, "./a.txt").unwrap(), file);
        assert_eq!(tree.resolve(docs, "../docs/a.txt").unwrap(), file);
        assert_eq!(tree.full_path(file), "/docs/a.txt");
    }

    #[test]
    fn test_dotdot_at_root_stays_at_root() {
        let tree = DirTree::new();
        assert_eq!(tree.resolve(tree.root(), "/../..").unwrap(), tree.root());
    }

    #[test]
    fn test_resolve_not_found() {
        let tree = DirTree::new();
        assert!(matches!(
            tree.resolve(tree.root(), "/missing"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_resolve_through_file() {
        let mut tree = DirTree::new();
        tree.insert(tree.root(), Entry::file("f", 0, sample_hash(), CHAIN_END))
            .unwrap();
        assert!(matches!(
            tree.resolve(tree.root(), "/f/deeper"),
            Err(FsError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut tree = DirTree::new();
        tree.insert(tree.root(), Entry::directory("docs")).unwrap();
        let result = tree.insert(tree.root(), Entry::directory("docs"));
        assert!(matches!(result, Err(FsError::DuplicateName(_))));
    }

    #[test]
    fn test_insert_under_file_rejected() {
        let mut tree = DirTree::new();
        let f = tree
            .insert(tree.root(), Entry::file("f", 0, sample_hash(), CHAIN_END))
            .unwrap();
        assert!(matches!(
            tree.insert(f, Entry::directory("x")),
            Err(FsError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_invalid_names() {
        let mut tree = DirTree::new();
        for name in ["", ".", "..", "a/b"] {
            assert!(matches!(
                tree.insert(tree.root(), Entry::directory(name)),
                Err(FsError::Config(_))
            ));
        }
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            tree.insert(tree.root(), Entry::directory(long)),
            Err(FsError::Config(_))
        ));
    }

    #[test]
    fn test_remove_file_returns_chain() {
        let mut tree = DirTree::new();
        let f = tree
            .insert(tree.root(), Entry::file("f", 100, sample_hash(), 5))
            .unwrap();
        let chains = tree.remove(f, false).unwrap();
        assert_eq!(chains, vec![5]);
        assert!(matches!(
            tree.resolve(tree.root(), "/f"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_nonempty_dir_requires_recursive() {
        let mut tree = DirTree::new();
        let docs = tree.insert(tree.root(), Entry::directory("docs")).unwrap();
        tree.insert(docs, Entry::file("a", 1, sample_hash(), 2))
            .unwrap();

        assert!(matches!(
            tree.remove(docs, false),
            Err(FsError::DirectoryNotEmpty(_))
        ));

        let chains = tree.remove(docs, true).unwrap();
        assert_eq!(chains, vec![2]);
    }

    #[test]
    fn test_recursive_remove_collects_all_chains() {
        let mut tree = DirTree::new();
        let a = tree.insert(tree.root(), Entry::directory("a")).unwrap();
        let b = tree.insert(a, Entry::directory("b")).unwrap();
        tree.insert(a, Entry::file("f1", 1, sample_hash(), 3)).unwrap();
        tree.insert(b, Entry::file("f2", 1, sample_hash(), 7)).unwrap();
        tree.insert(b, Entry::file("empty", 0, sample_hash(), CHAIN_END))
            .unwrap();

        let mut chains = tree.remove(a, true).unwrap();
        chains.sort();
        assert_eq!(chains, vec![3, 7]);
        assert_eq!(tree.len(), 1); // only the root remains
    }

    #[test]
    fn test_protected_blocks_removal() {
        let mut tree = DirTree::new();
        let docs = tree.insert(tree.root(), Entry::directory("docs")).unwrap();
        let f = tree
            .insert(docs, Entry::file("f", 1, sample_hash(), 2))
            .unwrap();
        tree.entry_mut(f).protected = true;

        // Protection deep in the subtree blocks the recursive removal too.
        assert!(matches!(
            tree.remove(docs, true),
            Err(FsError::Protected(_))
        ));
        assert!(tree.resolve(tree.root(), "/docs/f").is_ok());
    }

    #[test]
    fn test_rename_in_place() {
        let mut tree = DirTree::new();
        let f = tree
            .insert(tree.root(), Entry::file("old", 1, sample_hash(), 2))
            .unwrap();
        tree.rename(tree.root(), f, "new").unwrap();
        assert_eq!(tree.entry(f).name, "new");
        assert_eq!(tree.full_path(f), "/new");
    }

    #[test]
    fn test_rename_moves_across_directories() {
        let mut tree = DirTree::new();
        let docs = tree.insert(tree.root(), Entry::directory("docs")).unwrap();
        let f = tree
            .insert(tree.root(), Entry::file("f", 1, sample_hash(), 2))
            .unwrap();

        tree.rename(tree.root(), f, "/docs/renamed").unwrap();
        assert_eq!(tree.full_path(f), "/docs/renamed");
        assert!(tree.entry(docs).children.contains(&f));
        assert!(!tree.entry(tree.root()).children.contains(&f));
    }

    #[test]
    fn test_rename_into_directory_keeps_name() {
        let mut tree = DirTree::new();
        tree.insert(tree.root(), Entry::directory("docs")).unwrap();
        let f = tree
            .insert(tree.root(), Entry::file("f", 1, sample_hash(), 2))
            .unwrap();
        tree.rename(tree.root(), f, "/docs").unwrap();
        assert_eq!(tree.full_path(f), "/docs/f");
    }

    #[test]
    fn test_rename_collision() {
        let mut tree = DirTree::new();
        tree.insert(tree.root(), Entry::file("a", 1, sample_hash(), 2))
            .unwrap();
        let b = tree
            .insert(tree.root(), Entry::file("b", 1, sample_hash(), 3))
            .unwrap();
        assert!(matches!(
            tree.rename(tree.root(), b, "a"),
            Err(FsError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_rename_protected() {
        let mut tree = DirTree::new();
        let f = tree
            .insert(tree.root(), Entry::file("a", 1, sample_hash(), 2))
            .unwrap();
        tree.entry_mut(f).protected = true;
        assert!(matches!(
            tree.rename(tree.root(), f, "b"),
            Err(FsError::Protected(_))
        ));
    }

    #[test]
    fn test_cannot_move_dir_into_itself() {
        let mut tree = DirTree::new();
        let a = tree.insert(tree.root(), Entry::directory("a")).unwrap();
        tree.insert(a, Entry::directory("b")).unwrap();
        assert!(matches!(
            tree.rename(tree.root(), a, "/a/b"),
            Err(FsError::Config(_))
        ));
    }

    #[test]
    fn test_list_preserves_insertion_order() {
        let mut tree = DirTree::new();
        tree.insert(tree.root(), Entry::directory("zeta")).unwrap();
        tree.insert(tree.root(), Entry::directory("alpha")).unwrap();
        tree.insert(tree.root(), Entry::file("mid", 0, sample_hash(), CHAIN_END))
            .unwrap();

        let names: Vec<String> = tree
            .list(tree.root())
            .unwrap()
            .into_iter()
            .map(|id| tree.entry(id).name.clone())
            .collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_slot_reuse() {
        let mut tree = DirTree::new();
        let a = tree.insert(tree.root(), Entry::directory("a")).unwrap();
        tree.remove(a, false).unwrap();
        let b = tree.insert(tree.root(), Entry::directory("b")).unwrap();
        assert_eq!(a, b); // the freed slot is reused
    }

    #[test]
    fn test_serde_round_trip() {
        let mut tree = DirTree::new();
        let docs = tree.insert(tree.root(), Entry::directory("docs")).unwrap();
        tree.insert(docs, Entry::file("a.txt", 42, sample_hash(), 9))
            .unwrap();

        let bytes = bincode::serialize(&tree).unwrap();
        let decoded: DirTree = bincode::deserialize(&bytes).unwrap();
        decoded.validate().unwrap();

        let id = decoded.resolve(decoded.root(), "/docs/a.txt").unwrap();
        assert_eq!(decoded.entry(id).size, 42);
        assert_eq!(decoded.entry(id).start_block, 9);
    }

    #[test]
    fn test_validate_catches_broken_backlink() {
        let mut tree = DirTree::new();
        let docs = tree.insert(tree.root(), Entry::directory("docs")).unwrap();
        let f = tree
            .insert(docs, Entry::file("a", 1, sample_hash(), 2))
            .unwrap();
        tree.entry_mut(f).parent = Some(tree.root());

        assert!(matches!(
            tree.validate(),
            Err(FsError::CorruptFilesystem(_))
        ));
    }
}
