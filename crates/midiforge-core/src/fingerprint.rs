use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::{
    convert::render_score, merge::Scope, renderer::RendererFactory, scheduler::SchedulerSettings,
    score::Score,
};

const FINGERPRINT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderFingerprint {
    pub schema_version: u32,
    pub score_name: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: u64,
    pub pcm_hash: String,
}

#[must_use]
pub fn fingerprint_samples(
    score_name: &str,
    sample_rate: u32,
    channels: u16,
    samples: &[f32],
) -> RenderFingerprint {
    let mut hasher = Sha256::new();
    for sample in samples {
        hasher.update(sample.to_le_bytes());
    }
    let digest = hasher.finalize();

    RenderFingerprint {
        schema_version: FINGERPRINT_SCHEMA_VERSION,
        score_name: score_name.to_string(),
        sample_rate,
        channels,
        frames: (samples.len() / usize::from(channels.max(1))) as u64,
        pcm_hash: format!("{digest:x}"),
    }
}

#[instrument(skip(score, factory, settings), fields(score = %score.name))]
pub fn render_fingerprint(
    score: &Score,
    factory: &dyn RendererFactory,
    settings: &SchedulerSettings,
) -> Result<RenderFingerprint> {
    let audio = render_score(score, Scope::WholeFile, factory, settings)
        .with_context(|| format!("failed to render {}", score.name))?;
    let format = audio.summary.format;
    Ok(fingerprint_samples(
        &score.name,
        format.sample_rate,
        format.channels,
        &audio.samples,
    ))
}

pub fn read_fingerprint(path: &Path) -> Result<RenderFingerprint> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read fingerprint: {}", path.display()))?;
    serde_json::from_slice(&bytes).context("failed to parse fingerprint json")
}

pub fn write_fingerprint(path: &Path, fingerprint: &RenderFingerprint) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create fingerprint directory: {}", parent.display())
        })?;
    }

    let json =
        serde_json::to_vec_pretty(fingerprint).context("failed to encode fingerprint json")?;
    fs::write(path, json)
        .with_context(|| format!("failed to write fingerprint: {}", path.display()))?;
    Ok(())
}
