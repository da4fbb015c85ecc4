//! Offline export of stored predictions: parquet, a markdown summary and a
//! manifest with checksums.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tpr_core::Prediction;
use tpr_storage::AccuracyLedger;

pub const PREDICTIONS_FILE: &str = "predictions.parquet";
pub const ACCURACY_FILE: &str = "accuracy.md";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub predictions: usize,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes the three report files into `dir`, creating it if needed.
pub async fn export_predictions(
    dir: &Path,
    predictions: &[Prediction],
    accuracy: &AccuracyLedger,
) -> Result<ReportManifest> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let parquet_path = dir.join(PREDICTIONS_FILE);
    write_predictions_parquet(&parquet_path, predictions)?;

    let summary_path = dir.join(ACCURACY_FILE);
    fs::write(&summary_path, accuracy_markdown(predictions, accuracy))
        .await
        .with_context(|| format!("writing {}", summary_path.display()))?;

    let manifest = ReportManifest {
        schema_version: 1,
        generated_at: Utc::now(),
        predictions: predictions.len(),
        files: vec![
            manifest_entry("predictions", dir, &parquet_path)?,
            manifest_entry("accuracy", dir, &summary_path)?,
        ],
    };
    let manifest_path = dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(manifest)
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    total: u64,
    baseline_correct: u64,
    hybrid_correct: u64,
}

impl Tally {
    fn add(&mut self, prediction: &Prediction) {
        self.total += 1;
        self.baseline_correct += u64::from(prediction.baseline_correct);
        self.hybrid_correct += u64::from(prediction.hybrid_correct);
    }

    fn row(&self, label: &str) -> String {
        format!(
            "| {label} | {} | {} | {} |",
            self.total,
            percent(self.baseline_correct, self.total),
            percent(self.hybrid_correct, self.total)
        )
    }
}

fn percent(n: u64, d: u64) -> String {
    if d == 0 {
        "-".to_string()
    } else {
        format!("{:.1}%", 100.0 * n as f64 / d as f64)
    }
}

/// Markdown summary: overall accuracy, then split by overrule and archetype.
pub fn accuracy_markdown(predictions: &[Prediction], accuracy: &AccuracyLedger) -> String {
    let mut overruled = Tally::default();
    let mut kept = Tally::default();
    let mut by_archetype: BTreeMap<&str, Tally> = BTreeMap::new();
    for prediction in predictions {
        if prediction.overrule_reason.is_some() {
            overruled.add(prediction);
        } else {
            kept.add(prediction);
        }
        by_archetype
            .entry(prediction.archetype_tag.as_str())
            .or_default()
            .add(prediction);
    }

    let mut lines = vec![
        "# TPR Accuracy".to_string(),
        String::new(),
        format!("- Stored predictions: {}", accuracy.total),
        format!(
            "- Baseline accuracy: {}",
            percent(accuracy.baseline_correct, accuracy.total)
        ),
        format!(
            "- Hybrid accuracy: {}",
            percent(accuracy.hybrid_correct, accuracy.total)
        ),
        String::new(),
        "## By decision".to_string(),
        String::new(),
        "| decision | n | baseline | hybrid |".to_string(),
        "|---|---|---|---|".to_string(),
        overruled.row("overruled"),
        kept.row("baseline kept"),
        String::new(),
        "## By archetype".to_string(),
        String::new(),
        "| archetype | n | baseline | hybrid |".to_string(),
        "|---|---|---|---|".to_string(),
    ];
    lines.extend(by_archetype.iter().map(|(tag, tally)| tally.row(tag)));
    lines.push(String::new());
    lines.join("\n")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_predictions_parquet(path: &Path, predictions: &[Prediction]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("record_id", DataType::Utf8, false),
        ArrowField::new("record_qualified_id", DataType::Utf8, true),
        ArrowField::new("checkpoint_hash", DataType::Utf8, false),
        ArrowField::new("baseline_class", DataType::Utf8, false),
        ArrowField::new("baseline_confidence", DataType::Float64, false),
        ArrowField::new("hybrid_class", DataType::Utf8, false),
        ArrowField::new("hybrid_confidence", DataType::Float64, false),
        ArrowField::new("archetype_tag", DataType::Utf8, false),
        ArrowField::new("overrule_reason", DataType::Utf8, true),
        ArrowField::new("actual_outcome", DataType::Utf8, false),
        ArrowField::new("baseline_correct", DataType::Boolean, false),
        ArrowField::new("hybrid_correct", DataType::Boolean, false),
    ]));

    let utf8 = |f: &dyn Fn(&Prediction) -> Option<String>| {
        StringArray::from(predictions.iter().map(f).collect::<Vec<_>>())
    };
    let record_ids = utf8(&|p| Some(p.record_id.raw().to_string()));
    let qualified_ids = utf8(&|p| p.record_id.qualified());
    let hashes = utf8(&|p| Some(p.checkpoint_hash.clone()));
    let baseline_classes = utf8(&|p| Some(p.baseline_class.as_str().to_string()));
    let hybrid_classes = utf8(&|p| Some(p.hybrid_class.as_str().to_string()));
    let archetypes = utf8(&|p| Some(p.archetype_tag.clone()));
    let reasons = utf8(&|p| p.overrule_reason.clone());
    let outcomes = utf8(&|p| Some(p.actual_outcome.as_str().to_string()));
    let baseline_confidences =
        Float64Array::from(predictions.iter().map(|p| p.baseline_confidence).collect::<Vec<_>>());
    let hybrid_confidences =
        Float64Array::from(predictions.iter().map(|p| p.hybrid_confidence).collect::<Vec<_>>());
    let baseline_correct =
        BooleanArray::from(predictions.iter().map(|p| p.baseline_correct).collect::<Vec<_>>());
    let hybrid_correct =
        BooleanArray::from(predictions.iter().map(|p| p.hybrid_correct).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(record_ids),
            Arc::new(qualified_ids),
            Arc::new(hashes),
            Arc::new(baseline_classes),
            Arc::new(baseline_confidences),
            Arc::new(hybrid_classes),
            Arc::new(hybrid_confidences),
            Arc::new(archetypes),
            Arc::new(reasons),
            Arc::new(outcomes),
            Arc::new(baseline_correct),
            Arc::new(hybrid_correct),
        ],
    )
    .context("building predictions record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path) -> Result<ReportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpr_core::{Classification, ClassifiedOutput, RecordId};

    fn prediction(id: &str, hybrid: Classification, reason: Option<&str>) -> Prediction {
        Prediction::new(
            RecordId::new("lichess", id),
            "ab".repeat(32),
            ClassifiedOutput {
                class: Classification::Draw,
                confidence: 0.4,
            },
            ClassifiedOutput {
                class: hybrid,
                confidence: 0.75,
            },
            "balanced",
            reason.map(str::to_string),
            Classification::White,
        )
    }

    #[tokio::test]
    async fn export_writes_files_and_checksummed_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let predictions = vec![
            prediction("g1", Classification::White, Some("signature_override: bias +0.400")),
            prediction("g2", Classification::Black, None),
        ];
        let accuracy = AccuracyLedger::from_predictions(&predictions);

        let manifest = export_predictions(dir.path(), &predictions, &accuracy)
            .await
            .unwrap();

        assert_eq!(manifest.predictions, 2);
        assert_eq!(manifest.files.len(), 2);
        for file in &manifest.files {
            let bytes = std::fs::read(dir.path().join(&file.path)).unwrap();
            assert_eq!(file.bytes, bytes.len() as u64);
            assert_eq!(file.sha256, tpr_core::sha256_hex(&bytes));
        }
        assert!(dir.path().join(PREDICTIONS_FILE).exists());

        let stored: ReportManifest = serde_json::from_slice(
            &std::fs::read(dir.path().join(MANIFEST_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(stored, manifest);
    }

    #[test]
    fn markdown_splits_overruled_from_kept() {
        let predictions = vec![
            prediction("g1", Classification::White, Some("signature_override")),
            prediction("g2", Classification::Black, None),
        ];
        let accuracy = AccuracyLedger::from_predictions(&predictions);
        let md = accuracy_markdown(&predictions, &accuracy);
        assert!(md.contains("- Hybrid accuracy: 50.0%"));
        assert!(md.contains("- Baseline accuracy: 0.0%"));
        assert!(md.contains("| overruled | 1 | 0.0% | 100.0% |"));
        assert!(md.contains("| baseline kept | 1 | 0.0% | 0.0% |"));
        assert!(md.contains("| balanced | 2 | 0.0% | 50.0% |"));
    }

    #[tokio::test]
    async fn empty_export_still_produces_valid_files() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = export_predictions(&dir.path().join("nested"), &[], &AccuracyLedger::default())
            .await
            .unwrap();
        assert_eq!(manifest.predictions, 0);
        let md = std::fs::read_to_string(dir.path().join("nested").join(ACCURACY_FILE)).unwrap();
        assert!(md.contains("- Hybrid accuracy: -"));
    }
}
