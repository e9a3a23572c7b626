//! TOML-based neural hyperparameter configuration
//!
//! The default architecture dimensions are defined in `neural.toml` at the
//! crate root. This module deserializes that file once into a global
//! registry; checkpoints record the dimensions they were trained under and
//! refuse to load into a mismatched configuration.

use serde::Deserialize;
use std::sync::OnceLock;

/// Architecture dimensions of the character model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NeuralConfig {
    /// Context window length in symbols.
    pub window: usize,
    /// Embedding width per symbol.
    pub embed_dim: usize,
    /// Convolution output channels.
    pub conv_channels: usize,
    /// Convolution kernel width (odd, zero padded).
    pub kernel: usize,
    /// Recurrent hidden width per direction, per layer.
    pub hidden_dim: usize,
    /// Feed-forward head hidden width.
    pub ff_hidden: usize,
    /// Dropout probability on the head hidden layer.
    pub dropout: f32,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    model: NeuralConfig,
}

static CONFIG: OnceLock<NeuralConfig> = OnceLock::new();

/// The crate-default configuration, parsed once from the embedded
/// `neural.toml`.
pub fn config() -> &'static NeuralConfig {
    CONFIG.get_or_init(|| {
        let toml_str = include_str!("../../neural.toml");
        let file: ConfigFile = toml::from_str(toml_str).expect("Failed to parse neural.toml");
        file.model
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_config_parses() {
        let cfg = config();
        assert_eq!(cfg.window, 11);
        assert_eq!(cfg.embed_dim, 32);
        assert_eq!(cfg.conv_channels, 64);
        assert_eq!(cfg.hidden_dim, 64);
        assert_eq!(cfg.ff_hidden, 128);
    }

    #[test]
    fn test_kernel_is_odd() {
        assert_eq!(config().kernel % 2, 1);
    }

    #[test]
    fn test_dropout_is_a_probability() {
        let d = config().dropout;
        assert!((0.0..1.0).contains(&d));
    }
}
