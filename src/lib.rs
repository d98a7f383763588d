pub mod app;
pub mod camera3d;
pub mod cascades;
pub mod cli;
pub mod config;
pub mod culling;
pub mod geometry;
pub mod light;
pub mod mesh;
pub mod renderer;
pub mod scene;

pub use app::run_with_overrides;
