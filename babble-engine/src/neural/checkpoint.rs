//! Binary checkpoint codec for the character model.
//!
//! Format:
//! ```text
//! [4B]  magic "BBLN"
//! [4B]  version (1u32 LE)
//! [6×4B] architecture dims: window, embed_dim, conv_channels, kernel,
//!        hidden_dim, ff_hidden (u32 LE each)
//! [4B]  dropout (f32 LE)
//! [4B]  epoch (u32 LE)
//! [4B]  loss (f32 LE)
//! [4B]  matrix count (u32 LE)
//! For each matrix, in the fixed parameter order:
//!   [4B] rows (u32 LE)
//!   [4B] cols (u32 LE)
//!   [rows·cols×4B] data (f32 LE)
//! ```
//!
//! Decoding validates magic, version and every dimension against the
//! supplied configuration; any mismatch or truncation is
//! [`EngineError::CheckpointCorrupt`]. A corrupt blob never touches other
//! checkpoints; the caller simply keeps whatever model it had.

use super::config::NeuralConfig;
use super::model::CharModel;
use crate::error::{EngineError, Result};

const MAGIC: &[u8; 4] = b"BBLN";
const VERSION: u32 = 1;

/// A decoded checkpoint: the model plus its training metadata.
pub struct DecodedCheckpoint {
    pub model: CharModel,
    pub epoch: usize,
    pub loss: f32,
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Serialize full parameter state plus the epoch counter and last loss.
pub fn encode(model: &CharModel, epoch: usize, loss: f32) -> Vec<u8> {
    let cfg = model.config();
    let mats = model.params.mats();

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    push_u32(&mut out, VERSION);
    for dim in [
        cfg.window,
        cfg.embed_dim,
        cfg.conv_channels,
        cfg.kernel,
        cfg.hidden_dim,
        cfg.ff_hidden,
    ] {
        push_u32(&mut out, dim as u32);
    }
    push_f32(&mut out, cfg.dropout);
    push_u32(&mut out, epoch as u32);
    push_f32(&mut out, loss);
    push_u32(&mut out, mats.len() as u32);
    for m in mats {
        push_u32(&mut out, m.rows as u32);
        push_u32(&mut out, m.cols as u32);
        for &x in &m.data {
            push_f32(&mut out, x);
        }
    }
    out
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(EngineError::CheckpointCorrupt(
                "truncated checkpoint".to_string(),
            ));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_f32(&mut self) -> Result<f32> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn done(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

/// Deserialize a checkpoint into a model under `cfg`.
pub fn decode(bytes: &[u8], cfg: &NeuralConfig) -> Result<DecodedCheckpoint> {
    let mut r = Reader::new(bytes);

    if r.take(4)? != MAGIC {
        return Err(EngineError::CheckpointCorrupt(
            "bad magic, not a model checkpoint".to_string(),
        ));
    }
    let version = r.read_u32()?;
    if version != VERSION {
        return Err(EngineError::CheckpointCorrupt(format!(
            "unsupported checkpoint version {version}"
        )));
    }

    let dims = [
        ("window", cfg.window),
        ("embed_dim", cfg.embed_dim),
        ("conv_channels", cfg.conv_channels),
        ("kernel", cfg.kernel),
        ("hidden_dim", cfg.hidden_dim),
        ("ff_hidden", cfg.ff_hidden),
    ];
    for (name, expected) in dims {
        let stored = r.read_u32()? as usize;
        if stored != expected {
            return Err(EngineError::CheckpointCorrupt(format!(
                "architecture mismatch: {name} is {stored}, configured {expected}"
            )));
        }
    }
    let _dropout = r.read_f32()?;
    let epoch = r.read_u32()? as usize;
    let loss = r.read_f32()?;

    let mut model = CharModel::new(cfg.clone(), 0);
    let mat_count = r.read_u32()? as usize;
    {
        let mut mats = model.params.mats_mut();
        if mat_count != mats.len() {
            return Err(EngineError::CheckpointCorrupt(format!(
                "expected {} parameter matrices, found {mat_count}",
                mats.len()
            )));
        }
        for m in mats.iter_mut() {
            let rows = r.read_u32()? as usize;
            let cols = r.read_u32()? as usize;
            if rows != m.rows || cols != m.cols {
                return Err(EngineError::CheckpointCorrupt(format!(
                    "parameter shape mismatch: stored {rows}x{cols}, expected {}x{}",
                    m.rows, m.cols
                )));
            }
            for x in m.data.iter_mut() {
                *x = r.read_f32()?;
            }
        }
    }
    if !r.done() {
        return Err(EngineError::CheckpointCorrupt(
            "trailing bytes after parameters".to_string(),
        ));
    }

    Ok(DecodedCheckpoint { model, epoch, loss })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> NeuralConfig {
        NeuralConfig {
            window: 5,
            embed_dim: 4,
            conv_channels: 5,
            kernel: 3,
            hidden_dim: 3,
            ff_hidden: 6,
            dropout: 0.25,
        }
    }

    #[test]
    fn test_round_trip_reproduces_predictions() {
        let model = CharModel::new(tiny_config(), 77);
        let bytes = encode(&model, 4, 1.5);

        let decoded = decode(&bytes, &tiny_config()).unwrap();
        assert_eq!(decoded.epoch, 4);
        assert_eq!(decoded.loss, 1.5);
        assert_eq!(
            model.predict("HELLO WORLD").unwrap(),
            decoded.model.predict("HELLO WORLD").unwrap()
        );
    }

    #[test]
    fn test_bad_magic_rejected() {
        let model = CharModel::new(tiny_config(), 1);
        let mut bytes = encode(&model, 1, 2.0);
        bytes[0] = b'X';
        assert!(matches!(
            decode(&bytes, &tiny_config()),
            Err(EngineError::CheckpointCorrupt(_))
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        let model = CharModel::new(tiny_config(), 1);
        let bytes = encode(&model, 1, 2.0);
        assert!(matches!(
            decode(&bytes[..bytes.len() - 5], &tiny_config()),
            Err(EngineError::CheckpointCorrupt(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let model = CharModel::new(tiny_config(), 1);
        let mut bytes = encode(&model, 1, 2.0);
        bytes.push(0);
        assert!(matches!(
            decode(&bytes, &tiny_config()),
            Err(EngineError::CheckpointCorrupt(_))
        ));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let model = CharModel::new(tiny_config(), 1);
        let bytes = encode(&model, 1, 2.0);

        let mut other = tiny_config();
        other.hidden_dim = 4;
        let err = decode(&bytes, &other).unwrap_err();
        match err {
            EngineError::CheckpointCorrupt(msg) => assert!(msg.contains("hidden_dim")),
            other => panic!("expected CheckpointCorrupt, got {other:?}"),
        }
    }
}
