use std::{path::Path, sync::Arc, sync::LazyLock};

use anyhow::Result;
use regex::Regex;
use tracing::{debug, error, info};

use crate::{
    toolchain::{BuildOptions, ContainerToolchain},
    types::BuildResult,
};

static SUCCESS_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Successfully built ([0-9a-f]+)$").expect("build marker pattern is valid")
});

/// Drives the toolchain's image build and classifies its output.
pub struct BuildDriver {
    toolchain: Arc<dyn ContainerToolchain>,
    no_cache: bool,
}

impl BuildDriver {
    pub fn new(toolchain: Arc<dyn ContainerToolchain>) -> Self {
        Self {
            toolchain,
            no_cache: false,
        }
    }

    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    /// Build an image from `working_directory`.
    ///
    /// A build the toolchain reports as failed is `Ok` with a `Failure` outcome; `Err` is
    /// reserved for a toolchain that could not be invoked.
    pub async fn build(&self, working_directory: &Path) -> Result<BuildResult> {
        info!(dir = %working_directory.display(), "building image");
        let opts = BuildOptions {
            remove_intermediate: true,
            no_cache: self.no_cache,
        };
        let lines = self.toolchain.build(working_directory, opts).await?;
        debug!("build output:\n{}", lines.join("\n"));

        let result = parse_build_output(&lines);
        match &result.image_id {
            Some(image) => info!(image = %image, "image built"),
            None => error!("build failed: {}", result.message),
        }
        Ok(result)
    }
}

/// Classify build output by its last non-empty line.
pub fn parse_build_output<S: AsRef<str>>(lines: &[S]) -> BuildResult {
    let Some(last) = lines
        .iter()
        .map(|l| l.as_ref().trim())
        .rev()
        .find(|l| !l.is_empty())
    else {
        return BuildResult::failure("no output");
    };

    match SUCCESS_MARKER.captures(last) {
        Some(caps) => BuildResult::success(&caps[1], last),
        None => BuildResult::failure(last),
    }
}
