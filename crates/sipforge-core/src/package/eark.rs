//! E-ARK style SIP: one zip archive per SIP with a METS manifest.
//!
//! ```text
//! <sip id>.zip
//!   METS.xml
//!   metadata/descriptive/<entry>
//!   schemas/<schema>.xsd
//!   representations/<name>/data/...
//!   documentation/...
//! ```

use super::{archive_name, replace_output, PlannedTree, SipPlan};
use crate::config::{AppConfig, PackagingConfig};
use crate::error::{Result, SipError};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const METS_NAME: &str = "METS.xml";
const METADATA_DIR: &str = "metadata/descriptive";
const SCHEMAS_DIR: &str = "schemas";
const REPRESENTATIONS_DIR: &str = "representations";
const DOCUMENTATION_DIR: &str = "documentation";

pub(super) fn output_path(output_dir: &Path, sip_id: &str) -> PathBuf {
    output_dir.join(format!("{}.{}", sip_id, PackagingConfig::EARK_EXTENSION))
}

/// Write the archive, calling `on_entry(current, total)` after every entry.
pub(super) fn write(
    plan: &SipPlan,
    output_dir: &Path,
    on_entry: &mut dyn FnMut(usize, usize),
) -> Result<PathBuf> {
    let target = output_path(output_dir, &plan.sip_id);
    let partial = output_dir.join(format!(".{}.partial", plan.sip_id));

    let written = write_archive(plan, &partial, on_entry);
    if let Err(e) = written {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    replace_output(&partial, &target)?;
    debug!(sip_id = %plan.sip_id, "Wrote {}", target.display());
    Ok(target)
}

struct EntryCounter<'a> {
    current: usize,
    total: usize,
    on_entry: &'a mut dyn FnMut(usize, usize),
}

impl EntryCounter<'_> {
    fn tick(&mut self) {
        self.current += 1;
        (self.on_entry)(self.current, self.total);
    }
}

fn write_archive(
    plan: &SipPlan,
    partial: &Path,
    on_entry: &mut dyn FnMut(usize, usize),
) -> Result<()> {
    let schemas = plan.schemas();
    let mut counter = EntryCounter {
        current: 0,
        total: 1 + plan.metadata.len() + schemas.len() + plan.payload_entries(),
        on_entry,
    };

    let file = File::create(partial).map_err(|e| SipError::io_with_path(e, partial))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    let mut manifest = FileManifest::default();

    for entry in &plan.metadata {
        let name = archive_name(&[Path::new(METADATA_DIR), Path::new(&entry.id)]);
        let size = copy_into(&mut zip, options, &name, &entry.path)?;
        manifest.metadata.push((name, size));
        counter.tick();
    }

    for &schema in &schemas {
        let file_name = schema.file_name().map(Path::new).unwrap_or(schema);
        let name = archive_name(&[Path::new(SCHEMAS_DIR), file_name]);
        let size = copy_into(&mut zip, options, &name, schema)?;
        manifest.schemas.push((name, size));
        counter.tick();
    }

    for rep in &plan.representations {
        let base = Path::new(REPRESENTATIONS_DIR).join(&rep.name).join("data");
        let files = write_tree(&mut zip, options, &base, rep, &mut counter)?;
        manifest.representations.push((rep.name.clone(), files));
    }

    if !plan.documentation.is_empty() {
        let base = Path::new(DOCUMENTATION_DIR);
        manifest.documentation =
            write_tree(&mut zip, options, base, &plan.documentation, &mut counter)?;
    }

    let mets = build_mets(plan, &manifest);
    let xml = quick_xml::se::to_string(&mets)?;
    zip.start_file(METS_NAME, options)?;
    zip.write_all(b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n")?;
    zip.write_all(xml.as_bytes())?;
    counter.tick();

    zip.finish()?;
    Ok(())
}

fn write_tree(
    zip: &mut ZipWriter<File>,
    options: SimpleFileOptions,
    base: &Path,
    tree: &PlannedTree,
    counter: &mut EntryCounter<'_>,
) -> Result<Vec<(String, u64)>> {
    for dir in &tree.directories {
        zip.add_directory(archive_name(&[base, dir]), options)?;
        counter.tick();
    }
    let mut files = Vec::with_capacity(tree.files.len());
    for file in &tree.files {
        let name = archive_name(&[base, &file.relative]);
        let size = copy_into(zip, options, &name, &file.source)?;
        files.push((name, size));
        counter.tick();
    }
    Ok(files)
}

fn copy_into(
    zip: &mut ZipWriter<File>,
    options: SimpleFileOptions,
    name: &str,
    source: &Path,
) -> Result<u64> {
    let file = File::open(source).map_err(|e| SipError::io_with_path(e, source))?;
    let mut reader = BufReader::with_capacity(PackagingConfig::COPY_BUFFER_SIZE, file);
    zip.start_file(name, options)?;
    io::copy(&mut reader, zip).map_err(|e| SipError::io_with_path(e, source))
}

/// Archive paths and sizes of everything written, for the manifest.
#[derive(Default)]
struct FileManifest {
    metadata: Vec<(String, u64)>,
    schemas: Vec<(String, u64)>,
    representations: Vec<(String, Vec<(String, u64)>)>,
    documentation: Vec<(String, u64)>,
}

const METS_NS: &str = "http://www.loc.gov/METS/";
const XLINK_NS: &str = "http://www.w3.org/1999/xlink";

#[derive(Serialize)]
#[serde(rename = "mets")]
struct Mets {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "@xmlns:xlink")]
    xmlns_xlink: &'static str,
    #[serde(rename = "@OBJID")]
    obj_id: String,
    #[serde(rename = "@LABEL")]
    label: String,
    #[serde(rename = "@TYPE")]
    content_type: String,
    #[serde(rename = "@PROFILE")]
    profile: &'static str,
    #[serde(rename = "metsHdr")]
    header: MetsHdr,
    #[serde(rename = "dmdSec")]
    dmd_secs: Vec<DmdSec>,
    #[serde(rename = "fileSec")]
    file_sec: FileSec,
    #[serde(rename = "structMap")]
    struct_map: StructMap,
}

#[derive(Serialize)]
struct MetsHdr {
    #[serde(rename = "@CREATEDATE")]
    create_date: String,
    #[serde(rename = "@RECORDSTATUS")]
    record_status: &'static str,
    agent: Agent,
    #[serde(rename = "altRecordID", skip_serializing_if = "Option::is_none")]
    parent: Option<AltRecordId>,
}

#[derive(Serialize)]
struct Agent {
    #[serde(rename = "@ROLE")]
    role: &'static str,
    #[serde(rename = "@TYPE")]
    kind: &'static str,
    #[serde(rename = "@OTHERTYPE")]
    other_type: &'static str,
    name: String,
    note: String,
}

#[derive(Serialize)]
struct AltRecordId {
    #[serde(rename = "@TYPE")]
    kind: &'static str,
    #[serde(rename = "$text")]
    value: String,
}

#[derive(Serialize)]
struct DmdSec {
    #[serde(rename = "@ID")]
    id: String,
    #[serde(rename = "mdRef")]
    md_ref: MdRef,
}

#[derive(Serialize)]
struct MdRef {
    #[serde(rename = "@LOCTYPE")]
    loc_type: &'static str,
    #[serde(rename = "@MDTYPE")]
    md_type: &'static str,
    #[serde(rename = "@OTHERMDTYPE", skip_serializing_if = "Option::is_none")]
    other_md_type: Option<String>,
    #[serde(rename = "@MDTYPEVERSION", skip_serializing_if = "Option::is_none")]
    md_type_version: Option<String>,
    #[serde(rename = "@SIZE")]
    size: u64,
    #[serde(rename = "@xlink:href")]
    href: String,
}

#[derive(Serialize)]
struct FileSec {
    #[serde(rename = "fileGrp")]
    groups: Vec<FileGrp>,
}

#[derive(Serialize)]
struct FileGrp {
    #[serde(rename = "@USE")]
    usage: String,
    file: Vec<MetsFile>,
}

#[derive(Serialize)]
struct MetsFile {
    #[serde(rename = "@ID")]
    id: String,
    #[serde(rename = "@SIZE")]
    size: u64,
    #[serde(rename = "FLocat")]
    location: FLocat,
}

#[derive(Serialize)]
struct FLocat {
    #[serde(rename = "@LOCTYPE")]
    loc_type: &'static str,
    #[serde(rename = "@xlink:href")]
    href: String,
}

#[derive(Serialize)]
struct StructMap {
    #[serde(rename = "@TYPE")]
    kind: &'static str,
    div: Div,
}

#[derive(Serialize)]
struct Div {
    #[serde(rename = "@LABEL")]
    label: String,
    #[serde(rename = "div", skip_serializing_if = "Vec::is_empty")]
    children: Vec<Div>,
}

fn file_group(usage: &str, files: &[(String, u64)]) -> FileGrp {
    FileGrp {
        usage: usage.to_string(),
        file: files
            .iter()
            .enumerate()
            .map(|(i, (href, size))| MetsFile {
                id: format!("ID-{}-{}", usage.replace('/', "-"), i + 1),
                size: *size,
                location: FLocat {
                    loc_type: "URL",
                    href: href.clone(),
                },
            })
            .collect(),
    }
}

fn build_mets(plan: &SipPlan, manifest: &FileManifest) -> Mets {
    let dmd_secs = plan
        .metadata
        .iter()
        .zip(&manifest.metadata)
        .enumerate()
        .map(|(i, (entry, (href, size)))| DmdSec {
            id: format!("DMD-{}", i + 1),
            md_ref: MdRef {
                loc_type: "URL",
                md_type: entry.descriptive_type.mdtype(),
                other_md_type: entry.descriptive_type.other_mdtype(),
                md_type_version: entry.version.clone(),
                size: *size,
                href: href.clone(),
            },
        })
        .collect();

    let mut groups = Vec::new();
    if !manifest.schemas.is_empty() {
        groups.push(file_group(SCHEMAS_DIR, &manifest.schemas));
    }
    for (name, files) in &manifest.representations {
        groups.push(file_group(&format!("{}/{}", REPRESENTATIONS_DIR, name), files));
    }
    if !manifest.documentation.is_empty() {
        groups.push(file_group(DOCUMENTATION_DIR, &manifest.documentation));
    }

    let mut sections = vec![Div {
        label: "Metadata".to_string(),
        children: Vec::new(),
    }];
    sections.extend(plan.representations.iter().map(|rep| Div {
        label: format!("{}/{}", REPRESENTATIONS_DIR, rep.name),
        children: Vec::new(),
    }));
    if !plan.documentation.is_empty() {
        sections.push(Div {
            label: "Documentation".to_string(),
            children: Vec::new(),
        });
    }

    Mets {
        xmlns: METS_NS,
        xmlns_xlink: XLINK_NS,
        obj_id: plan.sip_id.clone(),
        label: plan.title.clone(),
        content_type: plan.content_type.clone(),
        profile: "http://www.eark-project.com/METS/IP.xml",
        header: MetsHdr {
            create_date: chrono::Utc::now().to_rfc3339(),
            record_status: "NEW",
            agent: Agent {
                role: "CREATOR",
                kind: "OTHER",
                other_type: "SOFTWARE",
                name: AppConfig::AGENT_NAME.to_string(),
                note: env!("CARGO_PKG_VERSION").to_string(),
            },
            parent: plan.parent_id.as_ref().map(|id| AltRecordId {
                kind: "PARENT",
                value: id.clone(),
            }),
        },
        dmd_secs,
        file_sec: FileSec { groups },
        struct_map: StructMap {
            kind: "PHYSICAL",
            div: Div {
                label: plan.sip_id.clone(),
                children: sections,
            },
        },
    }
}
