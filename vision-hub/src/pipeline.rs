//! The fixed sequence: load model, fetch image, preprocess, infer, export, verify.
//!
//! [`PipelineContext`] owns every collaborator for the duration of one run and is consumed
//! by [`PipelineContext::run`]. Nothing is kept in globals.

use std::path::PathBuf;

use anyhow::Context;
use derive_more::Display;
use tracing::info;
use utils::Timings;

use crate::{
    config::{ModelSource, PipelineConfig},
    export::{Exported, Exporter, TraceRecord},
    fetch::AssetFetcher,
    hub::ModelHub,
    inference::{PretrainedModel, Prediction},
    labels::Synset,
    preprocess::Preprocess,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Step {
    #[display("load_model")]
    LoadModel,
    #[display("fetch_image")]
    FetchImage,
    #[display("preprocess")]
    Preprocess,
    #[display("inference")]
    Inference,
    #[display("export")]
    Export,
    #[display("verify")]
    Verify,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Step::LoadModel,
        Step::FetchImage,
        Step::Preprocess,
        Step::Inference,
        Step::Export,
        Step::Verify,
    ];
}

#[derive(Debug)]
pub struct PipelineReport {
    pub model: String,
    pub image: PathBuf,
    /// Mechanism that downloaded the image.
    pub fetched_via: &'static str,
    pub prediction: Prediction,
    pub label: Option<String>,
    pub artifact: Exported,
    pub trace: TraceRecord,
    /// `None` when verification was disabled.
    pub round_trip_diff: Option<f32>,
    pub timings: Timings,
}

impl PipelineReport {
    /// The single line printed at the end of a run.
    pub fn summary_line(&self) -> String {
        match &self.label {
            Some(label) => format!("{} ({label})", self.prediction),
            None => self.prediction.to_string(),
        }
    }
}

pub struct PipelineContext {
    config: PipelineConfig,
    fetcher: AssetFetcher,
    model: PretrainedModel,
    labels: Option<Synset>,
    preprocess: Preprocess,
    exporter: Exporter,
    timings: Timings,
}

impl PipelineContext {
    /// Builds the context with the HTTP fetcher, loading the model right away.
    pub fn init(config: PipelineConfig) -> anyhow::Result<Self> {
        let fetcher = AssetFetcher::http()?;
        Self::with_fetcher(config, fetcher)
    }

    pub fn with_fetcher(config: PipelineConfig, fetcher: AssetFetcher) -> anyhow::Result<Self> {
        let mut timings = Timings::from_steps(Step::ALL.iter().map(ToString::to_string));
        let hub = ModelHub::new(&config.cache_dir);
        let model = timings.record(&Step::LoadModel.to_string(), || match &config.model {
            ModelSource::Hub(name) => hub.load(name, &fetcher),
            ModelSource::Path { name, path } => hub.load_path(name, path),
        })??;
        let labels = match (&config.labels, config.hub_labels) {
            (Some(path), _) => Some(Synset::from_path(path)?),
            (None, true) => Some(Synset::from_path(hub.cache().ensure_labels(&fetcher)?)?),
            (None, false) => None,
        };
        Ok(Self {
            config,
            fetcher,
            model,
            labels,
            preprocess: Preprocess::imagenet(),
            exporter: Exporter::new(),
            timings,
        })
    }

    pub fn run(mut self) -> anyhow::Result<PipelineReport> {
        let fetched = self
            .timings
            .record(&Step::FetchImage.to_string(), || {
                self.fetcher
                    .retrieve_into(&self.config.image_url, &self.config.work_dir)
            })?
            .context("fetching the sample image")?;

        let input = self.timings.record(&Step::Preprocess.to_string(), || {
            self.preprocess.apply_path(&fetched.path)
        })??;

        let scores = self
            .timings
            .record(&Step::Inference.to_string(), || self.model.infer(&input))??;
        let prediction = scores
            .top()
            .with_context(|| format!("{} returned no scores", self.model.name()))?;
        let label = self
            .labels
            .as_ref()
            .and_then(|synset| synset.label(prediction.index))
            .map(str::to_string);
        info!("{}: {prediction}", self.model.name());

        let (traced, artifact) = self.timings.record(&Step::Export.to_string(), || {
            let traced = self.exporter.trace(&self.model, &input)?;
            let exported = self.exporter.save(&traced, &self.config.artifact)?;
            anyhow::Ok((traced, exported))
        })??;

        let round_trip_diff = if self.config.verify_export {
            let diff = self.timings.record(&Step::Verify.to_string(), || {
                self.exporter.verify_round_trip(
                    &traced,
                    &artifact,
                    &input,
                    self.config.round_trip_tolerance,
                )
            })??;
            Some(diff)
        } else {
            None
        };

        Ok(PipelineReport {
            model: self.model.name().to_string(),
            image: fetched.path,
            fetched_via: fetched.mechanism,
            prediction,
            label,
            artifact,
            trace: traced.record().clone(),
            round_trip_diff,
            timings: self.timings,
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use url::Url;

    use super::*;
    use crate::{export::read_record, testing};

    fn offline_config(dir: &std::path::Path, classes: usize) -> anyhow::Result<PipelineConfig> {
        let model_path = testing::write_tiny_classifier(dir, classes)?;
        Ok(PipelineConfig {
            model: ModelSource::Path {
                name: "tiny".to_string(),
                path: model_path,
            },
            image_url: Url::parse("https://images.example.com/samples/gray.png")?,
            work_dir: dir.to_path_buf(),
            cache_dir: dir.join("cache"),
            artifact: dir.join("export").join("tiny.nnef.tar"),
            ..Default::default()
        })
    }

    #[test]
    fn test_step_names() {
        let names: Vec<String> = Step::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            vec!["load_model", "fetch_image", "preprocess", "inference", "export", "verify"]
        );
    }

    #[test]
    fn test_offline_run() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = offline_config(dir.path(), 5)?;
        let labels = dir.path().join("synset.txt");
        std::fs::write(&labels, "n0 zero\nn1 one\nn2 two\nn3 three\nn4 four\n")?;
        config.labels = Some(labels);

        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = AssetFetcher::new(
            Box::new(testing::Unreachable),
            Box::new(testing::ServeBytes::new(
                testing::png_bytes(320, 240, [128, 128, 128])?,
                calls.clone(),
            )),
        );
        let report = PipelineContext::with_fetcher(config.clone(), fetcher)?.run()?;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.fetched_via, "serve-bytes");
        assert_eq!(report.image, dir.path().join("gray.png"));
        assert_eq!(report.model, "tiny");

        // the positive weights grow with the class index, so the last class wins
        assert_eq!(report.prediction.index, 4);
        assert_eq!(report.label.as_deref(), Some("four"));
        assert!(report.summary_line().ends_with("at index 4 (four)"));

        assert!(config.artifact.is_file());
        assert_eq!(read_record(&report.artifact.record_path)?, report.trace);
        assert_eq!(report.trace.input_shape, vec![1, 3, 224, 224]);
        assert!(report.round_trip_diff.is_some_and(|d| d <= 1e-4));
        for step in Step::ALL {
            assert!(report.timings.elapsed(&step.to_string()).is_some(), "{step}");
        }
        Ok(())
    }

    #[test]
    fn test_hub_labels_are_fetched_into_the_cache() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = PipelineConfig {
            hub_labels: true,
            verify_export: false,
            ..offline_config(dir.path(), 3)?
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = AssetFetcher::new(
            Box::new(testing::ServeRoutes::new(
                vec![
                    ("synset.txt", b"n0 cat\nn1 dog\nn2 hen\n".to_vec()),
                    ("gray.png", testing::png_bytes(300, 280, [128, 128, 128])?),
                ],
                calls.clone(),
            )),
            Box::new(testing::Unreachable),
        );
        let report = PipelineContext::with_fetcher(config, fetcher)?.run()?;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.prediction.index, 2);
        assert_eq!(report.label.as_deref(), Some("hen"));
        assert!(dir.path().join("cache").join("synset.txt").is_file());
        Ok(())
    }

    #[test]
    fn test_unverified_run_skips_verify() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = PipelineConfig {
            verify_export: false,
            ..offline_config(dir.path(), 3)?
        };
        let fetcher = AssetFetcher::new(
            Box::new(testing::ServeBytes::new(
                testing::png_bytes(64, 64, [10, 200, 30])?,
                Arc::new(AtomicUsize::new(0)),
            )),
            Box::new(testing::Unreachable),
        );
        let report = PipelineContext::with_fetcher(config, fetcher)?.run()?;
        assert_eq!(report.round_trip_diff, None);
        assert_eq!(report.label, None);
        assert!(report.timings.elapsed("verify").is_none());
        Ok(())
    }

    #[test]
    fn test_fetch_failure_stops_before_export() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = offline_config(dir.path(), 3)?;
        let artifact = config.artifact.clone();
        let fetcher = AssetFetcher::new(Box::new(testing::Unreachable), Box::new(testing::Unreachable));
        let err = PipelineContext::with_fetcher(config, fetcher)?
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("sample image"));
        assert!(!artifact.exists());
        Ok(())
    }

    #[test]
    fn test_unknown_model_fails_at_init() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = PipelineConfig {
            model: ModelSource::Hub("alexnet".to_string()),
            cache_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let fetcher = AssetFetcher::new(Box::new(testing::Unreachable), Box::new(testing::Unreachable));
        assert!(PipelineContext::with_fetcher(config, fetcher).is_err());
        Ok(())
    }

    #[test]
    #[ignore = "requires network access"]
    fn test_default_pipeline() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = PipelineConfig {
            work_dir: dir.path().to_path_buf(),
            cache_dir: dir.path().join("cache"),
            artifact: dir.path().join("model.nnef.tar"),
            ..Default::default()
        };
        let report = PipelineContext::init(config)?.run()?;
        assert!(report.image.ends_with("dog.jpg"));
        assert!(report.prediction.index < 1000);
        Ok(())
    }
}
