//! Message envelope for the pixelcell transcode cell
//!
//! Requests and responses are flat JSON objects. A request names an `action`;
//! a response carries exactly one of a result (`binary`, plus `text` for
//! transcodes) or an `error`. Both carry the caller-assigned `id`.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use cellwire::Correlated;
use serde::{Deserialize, Serialize};

pub const DECODE_BINARY: &str = "decodeBinary";
pub const TRANSCODE_IMAGE: &str = "transcodeImage";

pub const DEFAULT_CONTENT_TYPE: &str = "image/png";
pub const DEFAULT_QUALITY: f32 = 0.8;
pub const MIN_QUALITY: f32 = 0.1;
pub const MAX_QUALITY: f32 = 1.0;

/// Caller-assigned correlation token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Encoded bytes tagged with a MIME content type.
///
/// Immutable once built; on the wire the bytes travel as base64.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryObject {
    content_type: String,
    #[serde(with = "base64_bytes")]
    bytes: Vec<u8>,
}

impl BinaryObject {
    pub fn new(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes,
        }
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Standard base64 of the bytes, without any data-URI header
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

impl fmt::Debug for BinaryObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryObject")
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// The `data` field of a request: inline binary or text.
///
/// Text is base64 for `decodeBinary` and a locator for `transcodeImage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataField {
    Binary(BinaryObject),
    Text(String),
}

/// Where a transcode reads its image from
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// Bytes supplied inline
    Binary(BinaryObject),
    /// Remote URL, `file://` URL, bare path, or `data:` URI
    Locator(String),
}

impl From<Source> for DataField {
    fn from(source: Source) -> Self {
        match source {
            Source::Binary(binary) => DataField::Binary(binary),
            Source::Locator(locator) => DataField::Text(locator),
        }
    }
}

impl From<DataField> for Source {
    fn from(data: DataField) -> Self {
        match data {
            DataField::Binary(binary) => Source::Binary(binary),
            DataField::Text(locator) => Source::Locator(locator),
        }
    }
}

/// Output image format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Png,
    WebP,
}

impl OutputFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
        }
    }

    /// Name used in the `outputFormat` field
    pub fn name(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::WebP => "webp",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OutputFormat {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let name = lower.strip_prefix("image/").unwrap_or(&lower);
        match name {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::WebP),
            _ => Err(EnvelopeError::InvalidField {
                field: "outputFormat",
                reason: format!("unsupported format `{s}` (expected jpeg, png or webp)"),
            }),
        }
    }
}

/// Problems with a request envelope, found before any work starts
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unknown action `{0}`")]
    UnknownAction(String),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Bounds and encoding parameters for a transcode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranscodeOptions {
    pub max_width: u32,
    pub max_height: u32,
    /// In `[0.1, 1.0]`
    pub quality: f32,
    pub output_format: OutputFormat,
}

impl TranscodeOptions {
    pub fn new(max_width: u32, max_height: u32) -> Self {
        Self {
            max_width,
            max_height,
            quality: DEFAULT_QUALITY,
            output_format: OutputFormat::default(),
        }
    }

    pub fn with_quality(mut self, quality: f32) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_format(mut self, output_format: OutputFormat) -> Self {
        self.output_format = output_format;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeBinaryPayload {
    /// Base64, optionally behind a data-URI header
    pub data: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeImagePayload {
    pub source: Source,
    pub options: TranscodeOptions,
}

/// A validated request body, one variant per action
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    DecodeBinary(DecodeBinaryPayload),
    TranscodeImage(TranscodeImagePayload),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::DecodeBinary(_) => DECODE_BINARY,
            Action::TranscodeImage(_) => TRANSCODE_IMAGE,
        }
    }
}

/// A request as it travels on the wire.
///
/// `action` stays a plain string here so that a request naming an action
/// this cell does not know still parses, and can be answered with an error
/// under its own id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub id: RequestId,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DataField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

impl RequestEnvelope {
    /// An envelope with only `id` and `action` set
    pub fn bare(id: impl Into<RequestId>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            data: None,
            content_type: None,
            max_width: None,
            max_height: None,
            quality: None,
            output_format: None,
        }
    }

    pub fn decode_binary(
        id: impl Into<RequestId>,
        data: impl Into<String>,
        content_type: Option<String>,
    ) -> Self {
        Self {
            data: Some(DataField::Text(data.into())),
            content_type,
            ..Self::bare(id, DECODE_BINARY)
        }
    }

    pub fn transcode_image(
        id: impl Into<RequestId>,
        source: Source,
        options: &TranscodeOptions,
    ) -> Self {
        Self {
            data: Some(source.into()),
            max_width: Some(f64::from(options.max_width)),
            max_height: Some(f64::from(options.max_height)),
            quality: Some(f64::from(options.quality)),
            output_format: Some(options.output_format.name().to_owned()),
            ..Self::bare(id, TRANSCODE_IMAGE)
        }
    }

    /// Split into the id and the validated action.
    ///
    /// Defaults are applied here: `contentType` falls back to `image/png`,
    /// `quality` to 0.8 and `outputFormat` to jpeg.
    pub fn into_parts(self) -> (RequestId, Result<Action, EnvelopeError>) {
        let RequestEnvelope {
            id,
            action,
            data,
            content_type,
            max_width,
            max_height,
            quality,
            output_format,
        } = self;

        let action = match action.as_str() {
            DECODE_BINARY => decode_binary_payload(data, content_type).map(Action::DecodeBinary),
            TRANSCODE_IMAGE => {
                transcode_image_payload(data, max_width, max_height, quality, output_format)
                    .map(Action::TranscodeImage)
            }
            other => Err(EnvelopeError::UnknownAction(other.to_owned())),
        };
        (id, action)
    }
}

impl Correlated for RequestEnvelope {
    fn correlation_id(&self) -> &str {
        self.id.as_str()
    }
}

fn decode_binary_payload(
    data: Option<DataField>,
    content_type: Option<String>,
) -> Result<DecodeBinaryPayload, EnvelopeError> {
    let data = match data.ok_or(EnvelopeError::MissingField("data"))? {
        DataField::Text(text) => text,
        DataField::Binary(_) => {
            return Err(EnvelopeError::InvalidField {
                field: "data",
                reason: "expected base64 text".to_owned(),
            });
        }
    };
    let content_type = content_type
        .filter(|ct| !ct.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned());
    Ok(DecodeBinaryPayload { data, content_type })
}

fn transcode_image_payload(
    data: Option<DataField>,
    max_width: Option<f64>,
    max_height: Option<f64>,
    quality: Option<f64>,
    output_format: Option<String>,
) -> Result<TranscodeImagePayload, EnvelopeError> {
    let source = Source::from(data.ok_or(EnvelopeError::MissingField("data"))?);
    let max_width = positive_dimension("maxWidth", max_width)?;
    let max_height = positive_dimension("maxHeight", max_height)?;

    let quality = match quality {
        None => DEFAULT_QUALITY,
        Some(q) if q.is_finite() && (MIN_QUALITY..=MAX_QUALITY).contains(&(q as f32)) => q as f32,
        Some(q) => {
            return Err(EnvelopeError::InvalidField {
                field: "quality",
                reason: format!("{q} is outside [{MIN_QUALITY}, {MAX_QUALITY}]"),
            });
        }
    };

    let output_format = match output_format {
        None => OutputFormat::default(),
        Some(name) => name.parse()?,
    };

    Ok(TranscodeImagePayload {
        source,
        options: TranscodeOptions {
            max_width,
            max_height,
            quality,
            output_format,
        },
    })
}

fn positive_dimension(field: &'static str, value: Option<f64>) -> Result<u32, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField(field))?;
    if !value.is_finite() || value < 1.0 || value.fract() != 0.0 || value > f64::from(u32::MAX) {
        return Err(EnvelopeError::InvalidField {
            field,
            reason: format!("{value} is not a positive integer"),
        });
    }
    Ok(value as u32)
}

/// What a successful request produced
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// `decodeBinary`: the decoded bytes
    Decoded { binary: BinaryObject },
    /// `transcodeImage`: the encoded image, and the same bytes as base64
    Transcoded { binary: BinaryObject, text: String },
}

impl Output {
    pub fn binary(&self) -> &BinaryObject {
        match self {
            Output::Decoded { binary } | Output::Transcoded { binary, .. } => binary,
        }
    }
}

/// A response: the originating id and either an output or an error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireResponse", into = "WireResponse")]
pub struct Response {
    pub id: RequestId,
    pub result: Result<Output, String>,
}

impl Response {
    pub fn success(id: RequestId, output: Output) -> Self {
        Self {
            id,
            result: Ok(output),
        }
    }

    pub fn failure(id: RequestId, message: impl Into<String>) -> Self {
        Self {
            id,
            result: Err(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.result.is_err()
    }

    pub fn error(&self) -> Option<&str> {
        self.result.as_ref().err().map(String::as_str)
    }
}

impl Correlated for Response {
    fn correlation_id(&self) -> &str {
        self.id.as_str()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    binary: Option<BinaryObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl TryFrom<WireResponse> for Response {
    type Error = EnvelopeError;

    fn try_from(wire: WireResponse) -> Result<Self, Self::Error> {
        let result = match (wire.binary, wire.text, wire.error) {
            (Some(binary), Some(text), None) => Ok(Output::Transcoded { binary, text }),
            (Some(binary), None, None) => Ok(Output::Decoded { binary }),
            (None, None, Some(error)) => Err(error),
            _ => {
                return Err(EnvelopeError::InvalidField {
                    field: "error",
                    reason: "a response carries exactly one of a result or an error".to_owned(),
                });
            }
        };
        Ok(Response {
            id: wire.id,
            result,
        })
    }
}

impl From<Response> for WireResponse {
    fn from(response: Response) -> Self {
        let (binary, text, error) = match response.result {
            Ok(Output::Decoded { binary }) => (Some(binary), None, None),
            Ok(Output::Transcoded { binary, text }) => (Some(binary), Some(text), None),
            Err(error) => (None, None, Some(error)),
        };
        WireResponse {
            id: response.id,
            binary,
            text,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> RequestEnvelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_decode_binary_defaults() {
        let req = parse(json!({ "id": "r1", "action": "decodeBinary", "data": "aGVsbG8=" }));
        let (id, action) = req.into_parts();
        assert_eq!(id.as_str(), "r1");
        assert_eq!(
            action.unwrap(),
            Action::DecodeBinary(DecodeBinaryPayload {
                data: "aGVsbG8=".into(),
                content_type: DEFAULT_CONTENT_TYPE.into(),
            })
        );
    }

    #[test]
    fn test_transcode_defaults_and_locator() {
        let req = parse(json!({
            "id": "r2",
            "action": "transcodeImage",
            "data": "https://example.com/cat.png",
            "maxWidth": 1200,
            "maxHeight": 900,
        }));
        let (_, action) = req.into_parts();
        let Action::TranscodeImage(payload) = action.unwrap() else {
            panic!("expected a transcode");
        };
        assert_eq!(
            payload.source,
            Source::Locator("https://example.com/cat.png".into())
        );
        assert_eq!(payload.options, TranscodeOptions::new(1200, 900));
        assert_eq!(payload.options.quality, 0.8);
        assert_eq!(payload.options.output_format, OutputFormat::Jpeg);
    }

    #[test]
    fn test_transcode_inline_binary() {
        let req = parse(json!({
            "id": "r3",
            "action": "transcodeImage",
            "data": { "contentType": "image/png", "bytes": "AQID" },
            "maxWidth": 10,
            "maxHeight": 10,
            "quality": 0.5,
            "outputFormat": "image/webp",
        }));
        let (_, action) = req.into_parts();
        let Action::TranscodeImage(payload) = action.unwrap() else {
            panic!("expected a transcode");
        };
        assert_eq!(
            payload.source,
            Source::Binary(BinaryObject::new("image/png", vec![1, 2, 3]))
        );
        assert_eq!(payload.options.output_format, OutputFormat::WebP);
        assert_eq!(payload.options.quality, 0.5);
    }

    #[test]
    fn test_unknown_action_keeps_id() {
        let req = parse(json!({ "id": "weird", "action": "unknownThing" }));
        let (id, action) = req.into_parts();
        assert_eq!(id.as_str(), "weird");
        assert_eq!(
            action.unwrap_err(),
            EnvelopeError::UnknownAction("unknownThing".into())
        );
    }

    #[test]
    fn test_invalid_transcode_fields() {
        let base = json!({ "id": "x", "action": "transcodeImage", "data": "a.png", "maxWidth": 10, "maxHeight": 10 });

        let mut missing = base.clone();
        missing.as_object_mut().unwrap().remove("maxHeight");
        assert_eq!(
            parse(missing).into_parts().1.unwrap_err(),
            EnvelopeError::MissingField("maxHeight")
        );

        for (field, value) in [
            ("maxWidth", json!(0)),
            ("maxWidth", json!(12.5)),
            ("maxHeight", json!(-3)),
            ("quality", json!(0.05)),
            ("quality", json!(1.5)),
            ("outputFormat", json!("gif")),
        ] {
            let mut bad = base.clone();
            bad[field] = value;
            let err = parse(bad).into_parts().1.unwrap_err();
            assert!(
                matches!(&err, EnvelopeError::InvalidField { field: f, .. } if *f == field),
                "{field}: {err}"
            );
        }
    }

    #[test]
    fn test_decode_binary_rejects_inline_binary() {
        let req = parse(json!({
            "id": "b",
            "action": "decodeBinary",
            "data": { "contentType": "image/png", "bytes": "AQID" },
        }));
        assert!(matches!(
            req.into_parts().1,
            Err(EnvelopeError::InvalidField { field: "data", .. })
        ));
    }

    #[test]
    fn test_constructors_produce_wire_shape() {
        let opts = TranscodeOptions::new(640, 480).with_format(OutputFormat::Png);
        let req = RequestEnvelope::transcode_image("t1", Source::Locator("/tmp/a.jpg".into()), &opts);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["action"], "transcodeImage");
        assert_eq!(value["data"], "/tmp/a.jpg");
        assert_eq!(value["maxWidth"], 640.0);
        assert_eq!(value["outputFormat"], "png");
        assert!(value.get("contentType").is_none());

        let (_, action) = req.into_parts();
        assert!(matches!(action, Ok(Action::TranscodeImage(p)) if p.options == opts));
    }

    #[test]
    fn test_response_wire_shapes() {
        let ok = Response::success(
            "a".into(),
            Output::Transcoded {
                binary: BinaryObject::new("image/jpeg", vec![0xff, 0xd8]),
                text: "/9g=".into(),
            },
        );
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "a",
                "binary": { "contentType": "image/jpeg", "bytes": "/9g=" },
                "text": "/9g=",
            })
        );
        assert_eq!(serde_json::from_value::<Response>(value).unwrap(), ok);

        let failed = Response::failure("b".into(), "decode error: bad");
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value, json!({ "id": "b", "error": "decode error: bad" }));
        assert_eq!(serde_json::from_value::<Response>(value).unwrap(), failed);
    }

    #[test]
    fn test_response_requires_exactly_one_outcome() {
        assert!(serde_json::from_value::<Response>(json!({ "id": "n" })).is_err());
        assert!(
            serde_json::from_value::<Response>(json!({
                "id": "both",
                "binary": { "contentType": "image/png", "bytes": "" },
                "error": "boom",
            }))
            .is_err()
        );
    }

    #[test]
    fn test_output_format_aliases() {
        assert_eq!("JPG".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert_eq!("image/png".parse::<OutputFormat>().unwrap(), OutputFormat::Png);
        assert_eq!(OutputFormat::WebP.mime(), "image/webp");
    }
}
