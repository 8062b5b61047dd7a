// ABOUTME: Audit maintenance commands - integrity verification, query, compliance export, eviction
// ABOUTME: Operate directly on the SQLite audit store; no services need to be running

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::Utc;

use crate::audit::store::MAX_PER_PAGE;
use crate::audit::{AuditFilter, AuditLogEntity, AuditStore, RecordSigner};

/// Re-verify every stored checksum, and every signature when a key is available.
/// Returns the ids that failed; fails when any did.
pub fn verify_audit(store_path: &Path, signing_key_env: Option<&str>) -> Result<Vec<String>> {
    let store = open_existing(store_path)?;
    tracing::info!("Verifying audit records in {}", store_path.display());

    let mut failed = store.verify_all().context("Failed to verify audit store")?;
    let checked = store.count()?;

    let signer = match signing_key_env {
        Some(var) => RecordSigner::from_env(var)?,
        None => None,
    };
    if let Some(signer) = signer {
        let mut signed = 0u64;
        for_each_record(&store, &AuditFilter::default(), |record| {
            if record.signature.is_none() {
                return Ok(());
            }
            signed += 1;
            if let Err(e) = signer.verify(record) {
                tracing::error!(audit_id = %record.id, "{}", e);
                let id = record.id.to_string();
                if !failed.contains(&id) {
                    failed.push(id);
                }
            }
            Ok(())
        })?;
        tracing::info!(signed, "signatures checked");
    } else {
        tracing::info!("No signing key available; checking checksums only");
    }

    if failed.is_empty() {
        tracing::info!(checked, "✓ All audit records verified");
        return Ok(failed);
    }
    for id in &failed {
        println!("{}", id);
    }
    bail!(
        "{} of {} audit records failed integrity verification",
        failed.len(),
        checked
    )
}

/// Print one page of matching records as pretty JSON.
pub fn query_audit(store_path: &Path, filter: &AuditFilter) -> Result<()> {
    let store = open_existing(store_path)?;
    let page = store.query(filter).context("Failed to query audit store")?;
    let json = serde_json::to_string_pretty(&page).context("Failed to serialize audit page")?;
    println!("{}", json);
    if page.has_more() {
        tracing::info!(
            "Showing page {} ({} of {} records); use --page for more",
            page.page,
            page.items.len(),
            page.total
        );
    }
    Ok(())
}

/// Write every matching record in compliance format, one JSON object per line.
pub fn export_compliance<W: Write>(store_path: &Path, filter: &AuditFilter, out: W) -> Result<u64> {
    let store = open_existing(store_path)?;
    let mut out = std::io::BufWriter::new(out);
    let mut exported = 0u64;
    for_each_record(&store, filter, |record| {
        serde_json::to_writer(&mut out, &record.to_compliance_format())
            .context("Failed to serialize compliance record")?;
        out.write_all(b"\n")?;
        exported += 1;
        Ok(())
    })?;
    out.flush().context("Failed to flush compliance export")?;
    tracing::info!(exported, "compliance export written");
    Ok(exported)
}

/// Delete records older than the retention window.
pub fn evict(store_path: &Path, retention_days: u32) -> Result<u64> {
    let store = open_existing(store_path)?;
    let evicted = store
        .evict_expired(retention_days, Utc::now())
        .context("Failed to evict audit records")?;
    tracing::info!(evicted, retention_days, "audit retention applied");
    Ok(evicted)
}

fn open_existing(store_path: &Path) -> Result<AuditStore> {
    if !store_path.exists() {
        bail!("Audit store {} does not exist", store_path.display());
    }
    AuditStore::open(store_path)
        .with_context(|| format!("Failed to open audit store {}", store_path.display()))
}

fn for_each_record<F>(store: &AuditStore, filter: &AuditFilter, mut visit: F) -> Result<()>
where
    F: FnMut(&AuditLogEntity) -> Result<()>,
{
    let mut filter = filter.clone();
    filter.per_page = MAX_PER_PAGE;
    filter.page = 1;
    loop {
        let page = store.query(&filter)?;
        for record in &page.items {
            visit(record)?;
        }
        if !page.has_more() || page.items.is_empty() {
            return Ok(());
        }
        filter.page += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditBuilder, AuditPolicy, SensitiveMatcher};
    use crate::context::OperationContext;
    use crate::event::tests::update_parts;
    use crate::event::{ChangeEvent, Operation};
    use serde_json::json;

    fn seeded_store(dir: &Path, count: i64) -> std::path::PathBuf {
        let path = dir.join("audit.db");
        let store = AuditStore::open(&path).unwrap();
        let builder = AuditBuilder::new(AuditPolicy::default(), SensitiveMatcher::default(), None);
        let ctx = OperationContext::new("acme").with_actor(Some("u-7".to_string()), None);
        for id in 0..count {
            let event = ChangeEvent::from_parts(update_parts(
                "products",
                id,
                json!({"id": id, "price": 100}),
                json!({"id": id, "price": 110}),
            ))
            .unwrap();
            store.append(&builder.build(&event, &ctx).unwrap()).unwrap();
        }
        path
    }

    #[test]
    fn test_export_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_store(dir.path(), 3);
        let mut out = Vec::new();
        let exported = export_compliance(&path, &AuditFilter::default(), &mut out).unwrap();
        assert_eq!(exported, 3);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let row: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(row["operation_type"], "UPDATE");
        assert_eq!(row["executed_by"], "u-7");
        assert_eq!(row["affected_fields"], json!(["price"]));
    }

    #[test]
    fn test_export_respects_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_store(dir.path(), 2);
        let filter = AuditFilter {
            operation: Some(Operation::Delete),
            ..AuditFilter::default()
        };
        let mut out = Vec::new();
        assert_eq!(export_compliance(&path, &filter, &mut out).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_verify_clean_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_store(dir.path(), 2);
        assert!(verify_audit(&path, None).unwrap().is_empty());
    }

    #[test]
    fn test_missing_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(evict(&dir.path().join("absent.db"), 90).is_err());
    }
}
