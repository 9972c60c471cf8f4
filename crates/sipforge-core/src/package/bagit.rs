//! BagIt SIP: one directory per SIP with a SHA-256 payload manifest.
//!
//! ```text
//! <sip id>/
//!   bagit.txt
//!   bag-info.txt
//!   manifest-sha256.txt
//!   data/metadata/descriptive/<entry>
//!   data/schemas/<schema>.xsd
//!   data/representations/<name>/...
//!   data/documentation/...
//! ```

use super::{archive_name, replace_output, PlannedTree, SipPlan};
use crate::config::{AppConfig, PackagingConfig};
use crate::error::{Result, SipError};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const TAG_FILES: usize = 3;

pub(super) fn output_path(output_dir: &Path, sip_id: &str) -> PathBuf {
    output_dir.join(sip_id)
}

/// Write the bag, calling `on_entry(current, total)` after every entry.
pub(super) fn write(
    plan: &SipPlan,
    output_dir: &Path,
    on_entry: &mut dyn FnMut(usize, usize),
) -> Result<PathBuf> {
    let target = output_path(output_dir, &plan.sip_id);
    let partial = output_dir.join(format!(".{}.partial", plan.sip_id));
    if partial.exists() {
        fs::remove_dir_all(&partial).map_err(|e| SipError::io_with_path(e, &partial))?;
    }

    if let Err(e) = write_bag(plan, &partial, on_entry) {
        let _ = fs::remove_dir_all(&partial);
        return Err(e);
    }
    replace_output(&partial, &target)?;
    debug!(sip_id = %plan.sip_id, "Wrote bag {}", target.display());
    Ok(target)
}

struct Bag<'a> {
    root: PathBuf,
    /// `(hex digest, relative path)` per payload file.
    manifest: Vec<(String, String)>,
    bytes: u64,
    current: usize,
    total: usize,
    on_entry: &'a mut dyn FnMut(usize, usize),
}

impl Bag<'_> {
    fn tick(&mut self) {
        self.current += 1;
        (self.on_entry)(self.current, self.total);
    }

    fn add_dir(&mut self, relative: &str) -> Result<()> {
        let dir = self.root.join(relative);
        fs::create_dir_all(&dir).map_err(|e| SipError::io_with_path(e, &dir))?;
        self.tick();
        Ok(())
    }

    /// Copy `source` to `relative`, hashing it on the way.
    fn add_file(&mut self, relative: String, source: &Path) -> Result<()> {
        let dest = self.root.join(&relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| SipError::io_with_path(e, parent))?;
        }
        let mut input = File::open(source).map_err(|e| SipError::io_with_path(e, source))?;
        let mut output = File::create(&dest).map_err(|e| SipError::io_with_path(e, &dest))?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; PackagingConfig::COPY_BUFFER_SIZE];
        loop {
            let read = input
                .read(&mut buffer)
                .map_err(|e| SipError::io_with_path(e, source))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            output
                .write_all(&buffer[..read])
                .map_err(|e| SipError::io_with_path(e, &dest))?;
            self.bytes += read as u64;
        }

        self.manifest.push((hex::encode(hasher.finalize()), relative));
        self.tick();
        Ok(())
    }

    fn add_tree(&mut self, base: &Path, tree: &PlannedTree) -> Result<()> {
        for dir in &tree.directories {
            self.add_dir(&archive_name(&[base, dir]))?;
        }
        for file in &tree.files {
            self.add_file(archive_name(&[base, &file.relative]), &file.source)?;
        }
        Ok(())
    }

    fn write_tag(&mut self, name: &str, content: &str) -> Result<()> {
        let path = self.root.join(name);
        fs::write(&path, content).map_err(|e| SipError::io_with_path(e, &path))?;
        self.tick();
        Ok(())
    }
}

fn write_bag(
    plan: &SipPlan,
    partial: &Path,
    on_entry: &mut dyn FnMut(usize, usize),
) -> Result<()> {
    let schemas = plan.schemas();
    let mut bag = Bag {
        root: partial.to_path_buf(),
        manifest: Vec::new(),
        bytes: 0,
        current: 0,
        total: plan.metadata.len() + schemas.len() + plan.payload_entries() + TAG_FILES,
        on_entry,
    };
    fs::create_dir_all(partial.join("data")).map_err(|e| SipError::io_with_path(e, partial))?;

    for entry in &plan.metadata {
        let relative = archive_name(&[
            Path::new("data/metadata/descriptive"),
            Path::new(&entry.id),
        ]);
        bag.add_file(relative, &entry.path)?;
    }
    for &schema in &schemas {
        let name = schema.file_name().map(Path::new).unwrap_or(schema);
        bag.add_file(archive_name(&[Path::new("data/schemas"), name]), schema)?;
    }
    for rep in &plan.representations {
        bag.add_tree(&Path::new("data/representations").join(&rep.name), rep)?;
    }
    if !plan.documentation.is_empty() {
        bag.add_tree(Path::new("data/documentation"), &plan.documentation)?;
    }

    bag.write_tag(
        "bagit.txt",
        &format!(
            "BagIt-Version: {}\nTag-File-Character-Encoding: UTF-8\n",
            PackagingConfig::BAGIT_VERSION
        ),
    )?;

    let mut info = format!(
        "Bag-Software-Agent: {} {}\nBagging-Date: {}\nExternal-Identifier: {}\nExternal-Description: {}\nPayload-Oxum: {}.{}\n",
        AppConfig::AGENT_NAME,
        env!("CARGO_PKG_VERSION"),
        chrono::Local::now().format("%Y-%m-%d"),
        plan.sip_id,
        tag_value(&plan.title),
        bag.bytes,
        bag.manifest.len(),
    );
    if let Some(parent) = &plan.parent_id {
        info.push_str(&format!("Parent-Identifier: {}\n", tag_value(parent)));
    }
    bag.write_tag("bag-info.txt", &info)?;

    let manifest: String = bag
        .manifest
        .iter()
        .map(|(digest, path)| format!("{}  {}\n", digest, path))
        .collect();
    bag.write_tag("manifest-sha256.txt", &manifest)?;
    Ok(())
}

/// Single-line form of a bag-info value.
fn tag_value(value: &str) -> String {
    value.split(['\r', '\n']).filter(|s| !s.is_empty()).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::DescriptiveType;
    use crate::package::{PlannedFile, StagedMetadata};
    use tempfile::TempDir;

    #[test]
    fn test_bag_layout_manifest_and_replacement() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("ead.xml"), "<ead/>").unwrap();
        fs::write(temp.path().join("a.txt"), "abc").unwrap();
        let out = temp.path().join("out");
        fs::create_dir_all(out.join("sip_bag/stale")).unwrap();

        let plan = SipPlan {
            sip_id: "sip_bag".to_string(),
            title: "Minutes".to_string(),
            parent_id: None,
            content_type: "MIXED".to_string(),
            metadata: vec![StagedMetadata {
                id: "ead.xml".to_string(),
                path: temp.path().join("ead.xml"),
                descriptive_type: DescriptiveType::Ead,
                version: None,
                schema: None,
            }],
            representations: vec![PlannedTree {
                name: "rep1".to_string(),
                directories: vec![],
                files: vec![PlannedFile {
                    source: temp.path().join("a.txt"),
                    relative: PathBuf::from("a.txt"),
                }],
            }],
            documentation: PlannedTree::default(),
        };

        let mut ticks = Vec::new();
        let bag = write(&plan, &out, &mut |c, t| ticks.push((c, t))).unwrap();

        assert_eq!(bag, out.join("sip_bag"));
        assert!(!bag.join("stale").exists());
        assert_eq!(ticks.last(), Some(&(5, 5)));
        assert_eq!(
            fs::read_to_string(bag.join("data/representations/rep1/a.txt")).unwrap(),
            "abc"
        );

        let manifest = fs::read_to_string(bag.join("manifest-sha256.txt")).unwrap();
        let sha_abc = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert!(manifest.contains(&format!("{}  data/representations/rep1/a.txt", sha_abc)));
        assert!(manifest.contains("data/metadata/descriptive/ead.xml"));

        let info = fs::read_to_string(bag.join("bag-info.txt")).unwrap();
        assert!(info.contains("External-Identifier: sip_bag"));
        assert!(info.contains("Payload-Oxum: 9.2"));
        assert!(bag.join("bagit.txt").is_file());
    }

    #[test]
    fn test_multiline_title_stays_one_tag_line() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), "abc").unwrap();
        let out = temp.path().join("out");

        let plan = SipPlan {
            sip_id: "sip_lines".to_string(),
            title: "Minutes\r\nBoard: 1998".to_string(),
            parent_id: Some("fonds\nx".to_string()),
            content_type: "MIXED".to_string(),
            metadata: vec![],
            representations: vec![PlannedTree {
                name: "rep1".to_string(),
                directories: vec![],
                files: vec![PlannedFile {
                    source: temp.path().join("a.txt"),
                    relative: PathBuf::from("a.txt"),
                }],
            }],
            documentation: PlannedTree::default(),
        };

        let bag = write(&plan, &out, &mut |_, _| {}).unwrap();
        let info = fs::read_to_string(bag.join("bag-info.txt")).unwrap();
        assert!(info.lines().all(|line| line.contains(": ")));
        assert!(info.contains("External-Description: Minutes Board: 1998\n"));
        assert!(info.contains("Parent-Identifier: fonds x\n"));
    }

    #[test]
    fn test_documentation_lands_in_manifest() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), "abc").unwrap();
        fs::write(temp.path().join("notes.txt"), "n").unwrap();
        let out = temp.path().join("out");

        let plan = SipPlan {
            sip_id: "sip_docs".to_string(),
            title: "Minutes".to_string(),
            parent_id: None,
            content_type: "MIXED".to_string(),
            metadata: vec![],
            representations: vec![PlannedTree {
                name: "rep1".to_string(),
                directories: vec![],
                files: vec![PlannedFile {
                    source: temp.path().join("a.txt"),
                    relative: PathBuf::from("a.txt"),
                }],
            }],
            documentation: PlannedTree {
                name: "documentation".to_string(),
                directories: vec![],
                files: vec![PlannedFile {
                    source: temp.path().join("notes.txt"),
                    relative: PathBuf::from("notes.txt"),
                }],
            },
        };

        let bag = write(&plan, &out, &mut |_, _| {}).unwrap();
        assert_eq!(
            fs::read_to_string(bag.join("data/documentation/notes.txt")).unwrap(),
            "n"
        );
        let manifest = fs::read_to_string(bag.join("manifest-sha256.txt")).unwrap();
        assert!(manifest.contains("  data/documentation/notes.txt\n"));
    }
}
