use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ViewportConfig {
    #[serde(default = "ViewportConfig::default_width")]
    pub width: u32,
    #[serde(default = "ViewportConfig::default_height")]
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShadowConfig {
    #[serde(default = "ShadowConfig::default_cascade_count")]
    pub cascade_count: u32,
    #[serde(default = "ShadowConfig::default_resolution")]
    pub resolution: u32,
    #[serde(default = "ShadowConfig::default_split_lambda")]
    pub split_lambda: f32,
    /// Caps the far end of the last cascade; `None` follows the camera far plane.
    #[serde(default)]
    pub shadow_distance: Option<f32>,
    /// How far up-light the virtual sun sits from the origin.
    #[serde(default = "ShadowConfig::default_light_distance")]
    pub light_distance: f32,
    #[serde(default = "ShadowConfig::default_depth_bias")]
    pub depth_bias: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Size of the global point light storage buffer.
    #[serde(default = "ClusterConfig::default_max_lights")]
    pub max_lights: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CullingConfig {
    #[serde(default = "CullingConfig::default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RendererConfig {
    #[serde(default)]
    pub viewport: ViewportConfig,
    #[serde(default)]
    pub shadow: ShadowConfig,
    #[serde(default)]
    pub clusters: ClusterConfig,
    #[serde(default)]
    pub culling: CullingConfig,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RendererConfigOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub cascade_count: Option<u32>,
    pub split_lambda: Option<f32>,
    pub shadow_resolution: Option<u32>,
}

impl ViewportConfig {
    const fn default_width() -> u32 {
        1280
    }

    const fn default_height() -> u32 {
        720
    }
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self { width: Self::default_width(), height: Self::default_height() }
    }
}

impl ShadowConfig {
    const fn default_cascade_count() -> u32 {
        4
    }

    const fn default_resolution() -> u32 {
        4096
    }

    const fn default_split_lambda() -> f32 {
        0.7
    }

    const fn default_light_distance() -> f32 {
        100.0
    }

    const fn default_depth_bias() -> f32 {
        0.0005
    }
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            cascade_count: Self::default_cascade_count(),
            resolution: Self::default_resolution(),
            split_lambda: Self::default_split_lambda(),
            shadow_distance: None,
            light_distance: Self::default_light_distance(),
            depth_bias: Self::default_depth_bias(),
        }
    }
}

impl ClusterConfig {
    const fn default_max_lights() -> u32 {
        1024
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self { max_lights: Self::default_max_lights() }
    }
}

impl CullingConfig {
    const fn default_enabled() -> bool {
        true
    }
}

impl Default for CullingConfig {
    fn default() -> Self {
        Self { enabled: Self::default_enabled() }
    }
}

impl RendererConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &RendererConfigOverrides) {
        if let Some(width) = overrides.width {
            self.viewport.width = width;
        }
        if let Some(height) = overrides.height {
            self.viewport.height = height;
        }
        if let Some(count) = overrides.cascade_count {
            self.shadow.cascade_count = count;
        }
        if let Some(lambda) = overrides.split_lambda {
            self.shadow.split_lambda = lambda;
        }
        if let Some(resolution) = overrides.shadow_resolution {
            self.shadow.resolution = resolution;
        }
    }
}

impl RendererConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.applied_fields().is_empty()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.width.is_some() {
            fields.push("width");
        }
        if self.height.is_some() {
            fields.push("height");
        }
        if self.cascade_count.is_some() {
            fields.push("cascades");
        }
        if self.split_lambda.is_some() {
            fields.push("lambda");
        }
        if self.shadow_resolution.is_some() {
            fields.push("resolution");
        }
        fields
    }
}
