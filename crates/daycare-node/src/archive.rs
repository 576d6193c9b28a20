//! In-memory tar archives of the student home directory.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read};
use std::path::{Component, Path};

use tar::{Builder, EntryType, Header};

const FILE_MODE: u32 = 0o666;
const DIR_MODE: u32 = 0o777;

/// Archive `files`, owned by `uid`, adding an entry for every parent
/// directory before the first file inside it.
pub fn pack(files: &BTreeMap<String, Vec<u8>>, uid: u32, mtime: u64) -> io::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    let mut dirs = BTreeSet::new();
    for (name, contents) in files {
        for dir in Path::new(name).ancestors().skip(1).collect::<Vec<_>>().into_iter().rev() {
            if dir.as_os_str().is_empty() || !dirs.insert(dir.to_path_buf()) {
                continue;
            }
            let mut header = header(EntryType::Directory, DIR_MODE, 0, uid, mtime);
            builder.append_data(&mut header, dir, io::empty())?;
        }
        let mut header = header(EntryType::Regular, FILE_MODE, contents.len() as u64, uid, mtime);
        builder.append_data(&mut header, name, contents.as_slice())?;
    }
    builder.into_inner()
}

fn header(kind: EntryType, mode: u32, size: u64, uid: u32, mtime: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_size(size);
    header.set_uid(uid.into());
    header.set_gid(uid.into());
    header.set_mtime(mtime);
    header
}

/// Regular files in `archive`, keyed by their cleaned relative path.
pub fn unpack(archive: &[u8]) -> io::Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let mut reader = tar::Archive::new(archive);
    for entry in reader.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let Some(name) = clean(&entry.path()?) else {
            continue;
        };
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut contents)?;
        files.insert(name, contents);
    }
    Ok(files)
}

/// Relative path with `.` segments removed; `None` for anything escaping the root.
fn clean(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
