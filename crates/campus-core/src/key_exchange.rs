//! Out-of-band key exchange over QR codes
//!
//! One side generates a conversation key and shows it as a QR code; the
//! other side points a camera at it. The camera pipeline is external: it
//! hands raw frames to a [`FrameDecoder`], and a [`ScanSession`] keeps the
//! first frame that decodes to a valid payload.
//!
//! Payload text: `campus-key:1:<conversation address>:<base64 key>`

use qrcode::render::{svg, unicode};
use qrcode::QrCode;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cipher::{CipherError, MessageKey};

const PAYLOAD_PREFIX: &str = "campus-key";
const PAYLOAD_VERSION: &str = "1";

#[derive(Error, Debug)]
pub enum KeyExchangeError {
    #[error("Not a campus key payload")]
    UnrecognizedPayload,

    #[error("Unsupported key payload version '{0}'")]
    UnsupportedVersion(String),

    #[error("Key payload carries an invalid key: {0}")]
    InvalidKey(#[from] CipherError),

    #[error("Failed to render QR code: {0}")]
    Render(String),
}

/// What the QR code carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPayload {
    /// Conversation address the key belongs to
    pub address: String,
    pub key: MessageKey,
}

impl KeyPayload {
    pub fn new(address: impl Into<String>, key: MessageKey) -> Self {
        Self {
            address: address.into(),
            key,
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            PAYLOAD_PREFIX,
            PAYLOAD_VERSION,
            self.address,
            self.key.to_base64()
        )
    }

    pub fn parse(text: &str) -> Result<Self, KeyExchangeError> {
        let rest = text
            .trim()
            .strip_prefix(PAYLOAD_PREFIX)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or(KeyExchangeError::UnrecognizedPayload)?;

        let (version, rest) = rest
            .split_once(':')
            .ok_or(KeyExchangeError::UnrecognizedPayload)?;
        if version != PAYLOAD_VERSION {
            return Err(KeyExchangeError::UnsupportedVersion(version.to_string()));
        }

        // Base64 never contains ':', so the key is everything after the last one.
        let (address, key) = rest
            .rsplit_once(':')
            .ok_or(KeyExchangeError::UnrecognizedPayload)?;
        if address.is_empty() {
            return Err(KeyExchangeError::UnrecognizedPayload);
        }

        Ok(Self {
            address: address.to_string(),
            key: MessageKey::from_base64(key)?,
        })
    }
}

fn qr_for(payload: &KeyPayload) -> Result<QrCode, KeyExchangeError> {
    QrCode::new(payload.encode().as_bytes()).map_err(|e| KeyExchangeError::Render(e.to_string()))
}

/// Render for a terminal using half-block characters
pub fn render_terminal(payload: &KeyPayload) -> Result<String, KeyExchangeError> {
    let code = qr_for(payload)?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

/// Render as an SVG document of at least `size` x `size` pixels
pub fn render_svg(payload: &KeyPayload, size: u32) -> Result<String, KeyExchangeError> {
    let code = qr_for(payload)?;
    Ok(code
        .render::<svg::Color<'_>>()
        .min_dimensions(size, size)
        .build())
}

/// Turns one camera frame into the text of a QR code, if it contains one
pub trait FrameDecoder {
    type Frame;

    fn decode(&mut self, frame: &Self::Frame) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Nothing usable in this frame yet
    Pending,
    /// This frame produced the key
    Scanned(KeyPayload),
    /// A key was already captured; the frame was ignored
    AlreadyScanned,
}

/// Consumes frames until the first valid key payload
pub struct ScanSession<D: FrameDecoder> {
    decoder: D,
    result: Option<KeyPayload>,
    frames_seen: usize,
}

impl<D: FrameDecoder> ScanSession<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            result: None,
            frames_seen: 0,
        }
    }

    pub fn offer(&mut self, frame: &D::Frame) -> ScanOutcome {
        if self.result.is_some() {
            return ScanOutcome::AlreadyScanned;
        }
        self.frames_seen += 1;

        let Some(text) = self.decoder.decode(frame) else {
            return ScanOutcome::Pending;
        };

        match KeyPayload::parse(&text) {
            Ok(payload) => {
                debug!(
                    "Key payload scanned after {} frames for {}",
                    self.frames_seen, payload.address
                );
                self.result = Some(payload.clone());
                ScanOutcome::Scanned(payload)
            }
            Err(e) => {
                debug!("Ignoring QR code that is not a key payload: {}", e);
                ScanOutcome::Pending
            }
        }
    }

    pub fn result(&self) -> Option<&KeyPayload> {
        self.result.as_ref()
    }

    pub fn frames_seen(&self) -> usize {
        self.frames_seen
    }

    /// Drain a continuous frame feed, returning the first decoded key
    ///
    /// Returns `None` if the feed closes before any key was found.
    pub async fn run(mut self, mut frames: mpsc::Receiver<D::Frame>) -> Option<KeyPayload> {
        while let Some(frame) = frames.recv().await {
            if let ScanOutcome::Scanned(payload) = self.offer(&frame) {
                return Some(payload);
            }
        }
        None
    }
}
