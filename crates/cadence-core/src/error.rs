//! Error types shared by the demuxer, the decoders and the player.

/// The stage at which a decode pipeline operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Allocating the container context failed
    FormatCreate,
    /// Opening the input (file, network stream) failed
    FormatOpenInput,
    /// Probing the container for stream information failed
    FormatFindStreamInfo,
    /// No playable stream of the requested media type exists
    StreamNotFound,
    /// Allocating a codec context failed
    CodecContextCreate,
    /// Copying stream parameters into the codec context failed
    CodecContextSetParam,
    /// No decoder is available for the stream's codec
    CodecFindDecoder,
    /// Opening the decoder failed
    CodecOpen,
    /// Feeding a packet to the decoder failed
    CodecSendPacket,
    /// Pulling a decoded frame from the decoder failed
    CodecReceiveFrame,
    /// Creating the audio sample converter failed
    ResamplerInit,
    /// Creating a hardware decode session failed (recovered by software fallback)
    HardwareSessionCreate,
}

impl ErrorKind {
    /// Returns true if an error of this kind must stop playback.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorKind::HardwareSessionCreate)
    }

    /// Short stable name, used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::FormatCreate => "format create",
            ErrorKind::FormatOpenInput => "format open input",
            ErrorKind::FormatFindStreamInfo => "format find stream info",
            ErrorKind::StreamNotFound => "stream not found",
            ErrorKind::CodecContextCreate => "codec context create",
            ErrorKind::CodecContextSetParam => "codec context set param",
            ErrorKind::CodecFindDecoder => "codec find decoder",
            ErrorKind::CodecOpen => "codec open",
            ErrorKind::CodecSendPacket => "codec send packet",
            ErrorKind::CodecReceiveFrame => "codec receive frame",
            ErrorKind::ResamplerInit => "resampler init",
            ErrorKind::HardwareSessionCreate => "hardware session create",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised anywhere in the decode pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    kind: ErrorKind,
    message: String,
}

impl DecodeError {
    /// Creates a new error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a [`ErrorKind::StreamNotFound`] error.
    pub fn stream_not_found(media: &str) -> Self {
        Self::new(ErrorKind::StreamNotFound, format!("no playable {media} stream"))
    }

    /// Returns the stage that failed.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the backend supplied detail.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if this error must stop playback.
    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{} failed", self.kind)
        } else {
            write!(f, "{} failed: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for DecodeError {}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DecodeError>;
