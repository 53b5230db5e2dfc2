//! Virtual directory tree built from a flat container listing.

/// One node of the archive tree. `path` is relative to the archive root and
/// never carries a leading or trailing slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveNode {
    Directory {
        path: String,
        children: Vec<ArchiveNode>,
    },
    File {
        path: String,
    },
}

/// Permission bits used for directories (`rwxr-xr-x`); the backend keeps none.
pub const DIRECTORY_MODE: u32 = 0o755;

/// Permission bits used for files (`rw-r--r--`).
pub const FILE_MODE: u32 = 0o644;

impl ArchiveNode {
    pub fn path(&self) -> &str {
        match self {
            Self::Directory { path, .. } | Self::File { path } => path,
        }
    }

    fn name(&self) -> &str {
        self.path().rsplit('/').next().unwrap_or_default()
    }
}

/// Build the tree for a listing of object names.
///
/// A name with one path component is a file leaf; longer names introduce one
/// directory per distinct first component. Sibling order is the order in
/// which names first appear in the listing. Empty components (from leading,
/// doubled or trailing slashes) are skipped, so pseudo-directory marker
/// objects such as `a/` only contribute their directory.
pub fn build_tree<S: AsRef<str>>(names: &[S]) -> Vec<ArchiveNode> {
    let mut roots = Vec::new();
    for name in names {
        let parts: Vec<&str> = name
            .as_ref()
            .split('/')
            .filter(|part| !part.is_empty())
            .collect();
        if !parts.is_empty() {
            insert(&mut roots, "", &parts, name.as_ref().ends_with('/'));
        }
    }
    roots
}

fn insert(level: &mut Vec<ArchiveNode>, prefix: &str, parts: &[&str], marker: bool) {
    let path = join(prefix, parts[0]);
    if parts.len() == 1 && !marker {
        if !level.iter().any(|node| node.name() == parts[0]) {
            level.push(ArchiveNode::File { path });
        }
        return;
    }

    let position = level.iter().position(|node| {
        matches!(node, ArchiveNode::Directory { .. }) && node.name() == parts[0]
    });
    let index = match position {
        Some(index) => index,
        None => {
            level.push(ArchiveNode::Directory {
                path: path.clone(),
                children: Vec::new(),
            });
            level.len() - 1
        }
    };
    if let ArchiveNode::Directory { children, .. } = &mut level[index] {
        if parts.len() > 1 {
            insert(children, &path, &parts[1..], marker);
        }
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Every node in depth-first pre-order. A directory comes right before its
/// own contents, and its subtree ends before its next sibling starts.
pub fn depth_first(tree: &[ArchiveNode]) -> Vec<&ArchiveNode> {
    let mut out = Vec::new();
    walk(tree, &mut |node| out.push(node));
    out
}

fn walk<'a>(tree: &'a [ArchiveNode], visit: &mut impl FnMut(&'a ArchiveNode)) {
    for node in tree {
        visit(node);
        if let ArchiveNode::Directory { children, .. } = node {
            walk(children, visit);
        }
    }
}
