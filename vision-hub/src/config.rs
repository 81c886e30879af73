use std::path::PathBuf;

use url::Url;

use crate::export::{DEFAULT_ARTIFACT, ROUND_TRIP_TOLERANCE};

pub const DEFAULT_MODEL: &str = "resnet18";
pub const DEFAULT_IMAGE_URL: &str = "https://github.com/pytorch/hub/raw/master/dog.jpg";
pub const DEFAULT_CACHE_DIR: &str = ".hub-cache";

/// Where the pretrained model comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Registry name, downloaded into the cache on first use.
    Hub(String),
    /// Local ONNX file.
    Path { name: String, path: PathBuf },
}

impl ModelSource {
    pub fn name(&self) -> &str {
        match self {
            ModelSource::Hub(name) => name,
            ModelSource::Path { name, .. } => name,
        }
    }
}

/// Everything a pipeline run needs. The default reproduces the fixed run: resnet18 on the
/// dog sample, exported to `model.nnef.tar` in the working directory.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub model: ModelSource,
    pub image_url: Url,
    /// Directory receiving the sample image.
    pub work_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub artifact: PathBuf,
    /// Optional `synset.txt` to name the predicted class.
    pub labels: Option<PathBuf>,
    /// Without `labels`, name the class with the hub's ImageNet synset, cached next to the models.
    pub hub_labels: bool,
    pub verify_export: bool,
    pub round_trip_tolerance: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: ModelSource::Hub(DEFAULT_MODEL.to_string()),
            image_url: default_image_url(),
            work_dir: PathBuf::from("."),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            artifact: PathBuf::from(DEFAULT_ARTIFACT),
            labels: None,
            hub_labels: false,
            verify_export: true,
            round_trip_tolerance: ROUND_TRIP_TOLERANCE,
        }
    }
}

pub fn default_image_url() -> Url {
    Url::parse(DEFAULT_IMAGE_URL).expect("default image url is valid")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fetch::local_filename_for;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.model.name(), "resnet18");
        assert_eq!(local_filename_for(&config.image_url), Some("dog.jpg"));
        assert_eq!(config.artifact, PathBuf::from("model.nnef.tar"));
        assert!(config.verify_export);
    }
}
