//! Named pretrained models, their download cache and loading.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use tract_onnx::prelude::*;
use url::Url;

use crate::{fetch::AssetFetcher, inference::PretrainedModel, preprocess::IMAGENET_INPUT_SHAPE};

/// A model the hub knows how to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubEntry {
    pub name: &'static str,
    pub url: &'static str,
    pub input_shape: [usize; 4],
    pub description: &'static str,
}

macro_rules! zoo_entry {
    ($name:literal, $path:literal, $description:literal) => {
        HubEntry {
            name: $name,
            url: concat!(
                "https://github.com/onnx/models/raw/main/validated/vision/classification/",
                $path
            ),
            input_shape: IMAGENET_INPUT_SHAPE,
            description: $description,
        }
    };
}

/// ImageNet classifiers from the ONNX model zoo, all trained with the standard
/// 224x224 crop and mean/std normalization.
pub const ENTRIES: &[HubEntry] = &[
    zoo_entry!(
        "resnet18",
        "resnet/model/resnet18-v1-7.onnx",
        "ResNet-18 v1, 1000 ImageNet classes"
    ),
    zoo_entry!(
        "resnet34",
        "resnet/model/resnet34-v1-7.onnx",
        "ResNet-34 v1, 1000 ImageNet classes"
    ),
    zoo_entry!(
        "resnet50",
        "resnet/model/resnet50-v1-7.onnx",
        "ResNet-50 v1, 1000 ImageNet classes"
    ),
    zoo_entry!(
        "mobilenetv2",
        "mobilenet/model/mobilenetv2-7.onnx",
        "MobileNet v2 1.0, 1000 ImageNet classes"
    ),
];

/// Class names matching the output index of every entry.
pub const IMAGENET_SYNSET_URL: &str = concat!(
    "https://github.com/onnx/models/raw/main/validated/vision/classification/",
    "synset.txt"
);
const SYNSET_FILE: &str = "synset.txt";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum HubError {
    #[error("unknown model {name}, the hub knows: {known}")]
    UnknownModel { name: String, known: String },
}

pub fn lookup(name: &str) -> Result<&'static HubEntry, HubError> {
    ENTRIES
        .iter()
        .find(|entry| entry.name == name)
        .ok_or_else(|| HubError::UnknownModel {
            name: name.to_string(),
            known: ENTRIES.iter().map(|e| e.name).collect::<Vec<_>>().join(", "),
        })
}

/// Directory of downloaded models, one `<name>.onnx` file per entry. Survives across runs.
#[derive(Debug, Clone)]
pub struct HubCache {
    dir: PathBuf,
}

impl HubCache {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, entry: &HubEntry) -> PathBuf {
        self.dir.join(format!("{}.onnx", entry.name))
    }

    /// Returns the cached file of `entry`, downloading it first when absent or empty.
    pub fn ensure(&self, entry: &HubEntry, fetcher: &AssetFetcher) -> anyhow::Result<PathBuf> {
        self.ensure_file(self.path_for(entry), entry.url, fetcher)
            .with_context(|| format!("downloading pretrained weights of {}", entry.name))
    }

    /// Cached `synset.txt` shared by every entry, downloaded on first use.
    pub fn ensure_labels(&self, fetcher: &AssetFetcher) -> anyhow::Result<PathBuf> {
        self.ensure_file(self.dir.join(SYNSET_FILE), IMAGENET_SYNSET_URL, fetcher)
            .context("downloading the ImageNet class names")
    }

    fn ensure_file(&self, path: PathBuf, url: &str, fetcher: &AssetFetcher) -> anyhow::Result<PathBuf> {
        if fs::metadata(&path).is_ok_and(|meta| meta.is_file() && meta.len() > 0) {
            debug!("{} found in cache", path.display());
            return Ok(path);
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating hub cache {}", self.dir.display()))?;
        let url = Url::parse(url)?;
        info!("downloading {url} into {}", path.display());
        fetcher.retrieve(&url, &path)?;
        Ok(path)
    }
}

/// Resolves model names to loaded models through the cache.
#[derive(Debug, Clone)]
pub struct ModelHub {
    cache: HubCache,
}

impl ModelHub {
    pub fn new<P: Into<PathBuf>>(cache_dir: P) -> Self {
        Self {
            cache: HubCache::new(cache_dir),
        }
    }

    pub fn cache(&self) -> &HubCache {
        &self.cache
    }

    pub fn load(&self, name: &str, fetcher: &AssetFetcher) -> anyhow::Result<PretrainedModel> {
        let entry = lookup(name)?;
        let path = self.cache.ensure(entry, fetcher)?;
        load_onnx(entry.name, &path, entry.input_shape)
    }

    /// Loads a local ONNX file, bypassing the registry and the cache.
    pub fn load_path(&self, name: &str, path: &Path) -> anyhow::Result<PretrainedModel> {
        load_onnx(name, path, IMAGENET_INPUT_SHAPE)
    }
}

/// Loads an ONNX classifier with its first input pinned to `input_shape` (`f32`).
pub fn load_onnx(name: &str, path: &Path, input_shape: [usize; 4]) -> anyhow::Result<PretrainedModel> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let source_sha256 = format!("{:x}", Sha256::digest(&bytes));
    let graph = tract_onnx::onnx()
        .model_for_read(&mut bytes.as_slice())
        .with_context(|| format!("decoding ONNX model {}", path.display()))?
        .with_input_fact(0, f32::fact(input_shape).into())?
        .into_typed()
        .with_context(|| format!("typing {name}"))?
        .into_decluttered()?;
    info!(
        "loaded {name} from {} ({}, sha256 {source_sha256})",
        path.display(),
        utils::format_bytes(bytes.len() as u64)
    );
    PretrainedModel::from_graph(name, source_sha256, graph)
}
