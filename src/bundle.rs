use crate::export::ExportTables;
use anyhow::Context;
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
pub const BUNDLE_FORMAT: &str = "evald-vendor-export-v1";

#[derive(Debug, Clone)]
pub struct BundleSummary {
    pub run_dir: PathBuf,
    pub bundle_path: PathBuf,
    pub file_count: usize,
    /// (table name, row count excluding the header) in vendor file order.
    pub row_counts: Vec<(String, usize)>,
}

/// Writes one export run: a `{term_id}/{timestamp}` directory holding the
/// vendor CSVs plus a zip bundle with a checksummed manifest. The directory
/// is created fresh; a timestamp collision within the same second is an
/// error rather than an overwrite.
pub fn write_export_bundle(
    exports_root: &Path,
    term_id: &str,
    timestamp: &str,
    tables: &ExportTables,
) -> anyhow::Result<BundleSummary> {
    let run_dir = exports_root.join(term_id).join(timestamp);
    if run_dir.exists() {
        return Err(anyhow::anyhow!(
            "export run directory already exists: {}",
            run_dir.to_string_lossy()
        ));
    }
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create directory {}", run_dir.to_string_lossy()))?;

    let mut row_counts = Vec::new();
    let mut manifest_files = Vec::new();
    for (name, headers, rows) in tables.files() {
        let file_name = format!("{}.csv", name);
        let path = run_dir.join(&file_name);
        write_csv(&path, headers, rows)?;
        row_counts.push((name.to_string(), rows.len()));
        manifest_files.push(json!({
            "name": file_name,
            "rows": rows.len(),
            "sha256": file_sha256(&path)?,
        }));
    }

    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "termId": term_id,
        "generatedAt": Utc::now().to_rfc3339(),
        "files": manifest_files,
    });
    let manifest_path = run_dir.join(MANIFEST_ENTRY);
    std::fs::write(
        &manifest_path,
        serde_json::to_string_pretty(&manifest).context("failed to serialize manifest")?,
    )
    .with_context(|| {
        format!(
            "failed to write manifest {}",
            manifest_path.to_string_lossy()
        )
    })?;

    let bundle_path = run_dir.join(format!("export-{}-{}.zip", term_id, timestamp));
    let out_file = File::create(&bundle_path).with_context(|| {
        format!(
            "failed to create bundle file {}",
            bundle_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, _, _) in tables.files() {
        let file_name = format!("{}.csv", name);
        zip.start_file(&file_name, opts)
            .with_context(|| format!("failed to start bundle entry {}", file_name))?;
        let bytes = std::fs::read(run_dir.join(&file_name))
            .with_context(|| format!("failed to read {}", file_name))?;
        zip.write_all(&bytes)
            .with_context(|| format!("failed to write bundle entry {}", file_name))?;
    }
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;
    zip.finish().context("failed to finalize zip bundle")?;

    Ok(BundleSummary {
        run_dir,
        bundle_path,
        file_count: row_counts.len() + 1,
        row_counts,
    })
}

fn write_csv(path: &Path, headers: &[&str], rows: &[Vec<String>]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.to_string_lossy()))?;
    writer
        .write_record(headers)
        .context("failed to write CSV header")?;
    for row in rows {
        writer
            .write_record(row)
            .with_context(|| format!("failed to write row in {}", path.to_string_lossy()))?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.to_string_lossy()))?;
    Ok(())
}

fn file_sha256(path: &Path) -> anyhow::Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read {} for checksum", path.to_string_lossy()))?;
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(format!("{:x}", hasher.finalize()))
}
