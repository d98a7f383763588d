use crate::config::RendererConfigOverrides;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;

const SUPPORTED_FLAGS: &str = "--width, --height, --cascades, --lambda, --resolution, --frames, --config";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CliOverrides {
    width: Option<u32>,
    height: Option<u32>,
    cascades: Option<u32>,
    lambda: Option<f32>,
    resolution: Option<u32>,
    frames: Option<u32>,
    config_path: Option<PathBuf>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                bail!("Unexpected argument '{flag}'. Supported flags: {SUPPORTED_FLAGS}.");
            };
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "width" => overrides.width = Some(parse_u32("width", &value)?),
                "height" => overrides.height = Some(parse_u32("height", &value)?),
                "cascades" => overrides.cascades = Some(parse_u32("cascade count", &value)?),
                "resolution" => overrides.resolution = Some(parse_u32("shadow resolution", &value)?),
                "frames" => overrides.frames = Some(parse_u32("frame count", &value)?),
                "lambda" => {
                    let lambda =
                        value.parse::<f32>().with_context(|| format!("Invalid split lambda '{value}'"))?;
                    if !(0.0..=1.0).contains(&lambda) {
                        bail!("Split lambda {lambda} must be within [0, 1].");
                    }
                    overrides.lambda = Some(lambda);
                }
                "config" => overrides.config_path = Some(PathBuf::from(value)),
                _ => bail!("Unknown flag '{flag}'. Supported flags: {SUPPORTED_FLAGS}."),
            }
        }
        Ok(overrides)
    }

    pub fn frames(&self) -> Option<u32> {
        self.frames
    }

    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config_path.as_ref()
    }

    pub fn config_overrides(&self) -> RendererConfigOverrides {
        RendererConfigOverrides {
            width: self.width,
            height: self.height,
            cascade_count: self.cascades,
            split_lambda: self.lambda,
            shadow_resolution: self.resolution,
        }
    }
}

fn parse_u32(label: &str, value: &str) -> Result<u32> {
    value.parse::<u32>().with_context(|| format!("Invalid {label} '{value}'"))
}
