pub mod config;
pub mod dataset;
pub mod degrade;
pub mod evaluate;
pub mod image_utils;
pub mod kernel;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod pca;
