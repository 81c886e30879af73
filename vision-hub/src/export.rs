//! Trace-export of a loaded model to a portable NNEF archive.
//!
//! Tracing evaluates the graph once on a witness input and records the operations that
//! actually ran. Only that path ends up described in the trace record: branches the witness
//! did not exercise are not captured, and nothing detects it.

use std::{
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, ensure};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use tract_nnef::framework::Nnef;
use tract_onnx::prelude::*;

use crate::inference::{PretrainedModel, Scores};

/// Artifact written when no other path is given.
pub const DEFAULT_ARTIFACT: &str = "model.nnef.tar";
/// Largest score difference accepted between a model and its reloaded artifact.
pub const ROUND_TRIP_TOLERANCE: f32 = 1e-4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracedOp {
    pub node: String,
    pub op: String,
}

/// Operation sequence executed while tracing, stored next to the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub model: String,
    pub source_sha256: String,
    pub input_shape: Vec<usize>,
    pub operations: Vec<TracedOp>,
}

pub struct TracedGraph {
    graph: TypedModel,
    record: TraceRecord,
    scores: Scores,
}

impl TracedGraph {
    pub fn record(&self) -> &TraceRecord {
        &self.record
    }

    /// Scores produced by the witness during tracing.
    pub fn scores(&self) -> &Scores {
        &self.scores
    }
}

#[derive(Debug, Clone)]
pub struct Exported {
    pub artifact: PathBuf,
    pub record_path: PathBuf,
    pub bytes: u64,
}

/// `<artifact>.trace.json`
pub fn record_path_for(artifact: &Path) -> PathBuf {
    let mut path = artifact.as_os_str().to_owned();
    path.push(".trace.json");
    PathBuf::from(path)
}

pub struct Exporter {
    nnef: Nnef,
}

impl Default for Exporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Exporter {
    pub fn new() -> Self {
        Self {
            nnef: tract_nnef::nnef().with_tract_core(),
        }
    }

    pub fn trace(&self, model: &PretrainedModel, witness: &Tensor) -> anyhow::Result<TracedGraph> {
        let fact = model.graph().input_fact(0)?;
        ensure!(
            fact.datum_type == witness.datum_type()
                && fact.shape.as_concrete() == Some(witness.shape()),
            "witness {:?} {:?} does not fit the input {:?} of {}",
            witness.datum_type(),
            witness.shape(),
            fact,
            model.name()
        );
        let graph = model.graph().clone();
        let outputs = graph
            .clone()
            .into_runnable()?
            .run(tvec!(witness.clone().into()))
            .with_context(|| format!("tracing {}", model.name()))?;
        let output = outputs
            .first()
            .with_context(|| format!("{} produced no output while tracing", model.name()))?;
        let scores = Scores::new(output.as_slice::<f32>()?.to_vec());

        let operations = graph
            .eval_order()?
            .into_iter()
            .map(|id| {
                let node = graph.node(id);
                TracedOp {
                    node: node.name.clone(),
                    op: node.op().name().to_string(),
                }
            })
            .collect::<Vec<_>>();
        debug!("traced {} operations of {}", operations.len(), model.name());
        let record = TraceRecord {
            model: model.name().to_string(),
            source_sha256: model.source_sha256().to_string(),
            input_shape: witness.shape().to_vec(),
            operations,
        };
        Ok(TracedGraph {
            graph,
            record,
            scores,
        })
    }

    /// Writes the archive to `path` and the trace record next to it.
    ///
    /// Both files are fully written to temporary files in the same directory before either is
    /// renamed into place, so a serialization failure leaves any previous export untouched.
    /// The record is renamed first: an artifact on disk always has a record at least as new.
    pub fn save(&self, traced: &TracedGraph, path: &Path) -> anyhow::Result<Exported> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

        let mut artifact_tmp = tempfile::Builder::new().prefix(".export-").tempfile_in(dir)?;
        self.nnef
            .write_to_tar(&traced.graph, artifact_tmp.as_file_mut())
            .with_context(|| format!("serializing {}", traced.record.model))?;
        artifact_tmp.as_file_mut().flush()?;
        let bytes = artifact_tmp.as_file().metadata()?.len();

        let mut record_tmp = tempfile::Builder::new().prefix(".trace-").tempfile_in(dir)?;
        {
            let mut writer = BufWriter::new(record_tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, &traced.record)?;
            writer.flush()?;
        }

        let record_path = record_path_for(path);
        record_tmp
            .persist(&record_path)
            .with_context(|| format!("writing trace record {}", record_path.display()))?;
        artifact_tmp
            .persist(path)
            .with_context(|| format!("writing artifact {}", path.display()))?;

        info!(
            "exported {} to {} ({}, {} traced ops)",
            traced.record.model,
            path.display(),
            utils::format_bytes(bytes),
            traced.record.operations.len()
        );
        Ok(Exported {
            artifact: path.to_path_buf(),
            record_path,
            bytes,
        })
    }

    /// Loads an artifact written by [`Exporter::save`], ready for inference.
    pub fn reload(&self, path: &Path) -> anyhow::Result<PretrainedModel> {
        let bytes = fs::read(path).with_context(|| format!("reading artifact {}", path.display()))?;
        let source_sha256 = format!("{:x}", Sha256::digest(&bytes));
        let graph = self
            .nnef
            .model_for_read(&mut bytes.as_slice())
            .with_context(|| format!("decoding artifact {}", path.display()))?
            .into_decluttered()?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.trim_end_matches(".tar").trim_end_matches(".nnef"))
            .unwrap_or("artifact");
        PretrainedModel::from_graph(name, source_sha256, graph)
    }

    /// Reloads `exported` and returns the largest score difference on `witness` compared to
    /// the traced scores. Fails when it exceeds `tolerance`.
    pub fn verify_round_trip(
        &self,
        traced: &TracedGraph,
        exported: &Exported,
        witness: &Tensor,
        tolerance: f32,
    ) -> anyhow::Result<f32> {
        let reloaded = self.reload(&exported.artifact)?;
        let scores = reloaded.infer(witness)?;
        let diff = traced.scores.max_abs_diff(&scores).with_context(|| {
            format!(
                "reloaded artifact yields {} classes instead of {}",
                scores.len(),
                traced.scores.len()
            )
        })?;
        ensure!(
            diff <= tolerance,
            "reloaded artifact {} drifts by {diff} (tolerance {tolerance})",
            exported.artifact.display()
        );
        debug!("round trip of {} within {diff}", exported.artifact.display());
        Ok(diff)
    }
}

/// Reads back a trace record.
pub fn read_record(path: &Path) -> anyhow::Result<TraceRecord> {
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}
