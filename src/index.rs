//! Ordered path index.
//!
//! Entries are keyed by their canonical absolute path and sorted by `(depth, path)`, where the
//! depth is the number of `/` separators in the path. This keeps all entries of one tree level
//! together, which bounds the range scan used to enumerate the children of directories which do
//! not carry their own child list.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{bail, Error};

use crate::stat::Stat;

/// Canonical path of the root directory.
pub const ROOT_PATH: &str = "/";

/// Inode number of the root directory, as expected by fuse.
pub const ROOT_INODE: u64 = 1;

/// Turn an archive entry name into the canonical absolute path used as index key.
///
/// Leading `./` and trailing `/` are removed, `.` and empty components are dropped and `..`
/// never climbs above the root. An empty result maps to the root path.
pub fn canonical_path(name: &str) -> String {
    let mut components: Vec<&str> = Vec::new();
    for component in name.split('/') {
        match component {
            "" | "." => (),
            ".." => {
                components.pop();
            }
            component => components.push(component),
        }
    }

    if components.is_empty() {
        return ROOT_PATH.to_string();
    }

    let mut path = String::with_capacity(name.len() + 1);
    for component in components {
        path.push('/');
        path.push_str(component);
    }
    path
}

/// The canonical parent of a canonical path, `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == ROOT_PATH {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT_PATH),
        Some(pos) => Some(&path[..pos]),
        None => None,
    }
}

/// The final component of a canonical path, empty for the root.
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[(pos + 1)..],
        None => path,
    }
}

/// Append `name` to the canonical directory path `dir`.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir == ROOT_PATH {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct IndexKey {
    depth: usize,
    path: String,
}

impl IndexKey {
    fn new(path: &str) -> Self {
        Self {
            depth: path.bytes().filter(|b| *b == b'/').count(),
            path: path.to_string(),
        }
    }
}

/// A file system entry.
///
/// Directories created with [`Node::directory`] carry the names of their children and can list
/// them directly. Nodes created with [`Node::new`] have no such list, the index falls back to a
/// range scan for them if they are directories.
#[derive(Clone, Debug)]
pub struct Node {
    name: String,
    inode: u64,
    stat: Stat,
    link_target: Option<String>,
    children: Option<BTreeSet<String>>,
}

impl Node {
    pub fn new<S: Into<String>>(name: S, stat: Stat) -> Self {
        Self {
            name: name.into(),
            inode: 0,
            stat,
            link_target: None,
            children: None,
        }
    }

    pub fn directory<S: Into<String>>(name: S, stat: Stat) -> Self {
        Self {
            children: Some(BTreeSet::new()),
            ..Self::new(name, stat)
        }
    }

    pub fn with_link_target<S: Into<String>>(mut self, target: S) -> Self {
        self.link_target = Some(target.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Assigned by the index when the node's path is first stored, `0` before that.
    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn stat(&self) -> &Stat {
        &self.stat
    }

    pub fn link_target(&self) -> Option<&str> {
        self.link_target.as_deref()
    }

    pub fn is_dir(&self) -> bool {
        self.stat.is_dir()
    }

    /// The names of this directory's children, if this node keeps track of them.
    pub fn children(&self) -> Option<&BTreeSet<String>> {
        self.children.as_ref()
    }

    pub(crate) fn add_child(&mut self, name: &str) {
        self.children
            .get_or_insert_with(BTreeSet::new)
            .insert(name.to_string());
    }
}

/// In-memory index of all entries of an archive.
pub struct PathIndex {
    tree: BTreeMap<IndexKey, Node>,
    inodes: HashMap<u64, IndexKey>,
    next_inode: u64,
}

impl Default for PathIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PathIndex {
    pub fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
            inodes: HashMap::new(),
            next_inode: ROOT_INODE + 1,
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Look up a canonical path.
    pub fn get(&self, path: &str) -> Option<&Node> {
        log::debug!("index get {:?}", path);
        self.tree.get(&IndexKey::new(path))
    }

    pub(crate) fn get_mut(&mut self, path: &str) -> Option<&mut Node> {
        self.tree.get_mut(&IndexKey::new(path))
    }

    /// Look up a node by its inode number, returning its canonical path as well.
    pub fn get_by_inode(&self, inode: u64) -> Option<(&str, &Node)> {
        let key = self.inodes.get(&inode)?;
        let node = self.tree.get(key)?;
        Some((key.path.as_str(), node))
    }

    /// Insert a node, or replace the node stored at `path`.
    ///
    /// Replacing keeps the inode number of the existing node. If the existing node has a child
    /// list and the new node is a directory, the children are carried over, so a placeholder
    /// directory can be upgraded without losing entries which were already linked to it.
    pub fn add(&mut self, path: &str, mut node: Node) -> Result<(), Error> {
        if !path.starts_with('/') {
            bail!("index keys must be absolute paths, got {:?}", path);
        }
        log::debug!("index add {:?} (mode {:o})", path, node.stat.mode);

        let key = IndexKey::new(path);
        if let Some(existing) = self.tree.get_mut(&key) {
            node.inode = existing.inode;
            if node.is_dir() {
                if let Some(children) = existing.children.take() {
                    match node.children {
                        Some(ref mut list) => list.extend(children),
                        None => node.children = Some(children),
                    }
                }
            }
            *existing = node;
            return Ok(());
        }

        node.inode = if path == ROOT_PATH {
            ROOT_INODE
        } else {
            let inode = self.next_inode;
            self.next_inode += 1;
            inode
        };
        self.inodes.insert(node.inode, key.clone());
        self.tree.insert(key, node);
        Ok(())
    }

    /// The direct children of the directory at `path`, sorted by name.
    ///
    /// Panics if `path` does not exist or is not a directory. Callers have to check this first.
    pub fn entries(&self, path: &str) -> Vec<&Node> {
        log::debug!("index entries {:?}", path);

        let key = IndexKey::new(path);
        let dir = match self.tree.get(&key) {
            Some(dir) => dir,
            None => panic!("non-existent index key {:?}", path),
        };
        if !dir.is_dir() {
            panic!("cannot list entries for non-directory {:?}", path);
        }

        if let Some(children) = dir.children() {
            return children
                .iter()
                .filter_map(|name| self.get(&join_path(path, name)))
                .collect();
        }

        log::debug!("performing range scan for entries of {:?}", path);
        // "//" sorts after "/" followed by any child name
        let until = IndexKey::new(&format!("{}//", path));
        self.tree
            .range(key..until)
            .filter(|(entry_key, _)| parent_path(&entry_key.path) == Some(path))
            .map(|(_, node)| node)
            .collect()
    }

    /// All entries in index order, which is by depth first and by path second.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.tree.iter().map(|(key, node)| (key.path.as_str(), node))
    }
}
