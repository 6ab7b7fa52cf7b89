//! The two operations a worker performs, built from the codec primitives.

use cell_transcode_proto::{
    Action, BinaryObject, DecodeBinaryPayload, Output, TranscodeImagePayload,
};
use tracing::debug;

use crate::codec::{self, EncodeTarget};
use crate::config::WorkerConfig;
use crate::error::TranscodeError;
use crate::fetch::Fetcher;

pub struct TranscodePipeline {
    fetcher: Fetcher,
    max_surface_pixels: u64,
}

impl TranscodePipeline {
    pub fn new(config: &WorkerConfig) -> Result<Self, TranscodeError> {
        Ok(Self {
            fetcher: Fetcher::new(config)?,
            max_surface_pixels: config.max_surface_pixels,
        })
    }

    /// Run a validated action to completion.
    pub async fn run(&self, action: Action) -> Result<Output, TranscodeError> {
        match action {
            Action::DecodeBinary(payload) => {
                let binary = self.decode_binary(payload)?;
                Ok(Output::Decoded { binary })
            }
            Action::TranscodeImage(payload) => self.transcode_image(payload).await,
        }
    }

    /// Base64 text to a tagged binary object. No I/O.
    #[tracing::instrument(level = "debug", skip_all, fields(text_len = payload.data.len(), content_type = %payload.content_type))]
    pub fn decode_binary(&self, payload: DecodeBinaryPayload) -> Result<BinaryObject, TranscodeError> {
        let bytes = codec::decode_base64(&payload.data)?;
        Ok(codec::tag_binary(bytes, Some(&payload.content_type)))
    }

    /// Decode, scale, re-encode, and attach the base64 form of the result.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(
            max_width = payload.options.max_width,
            max_height = payload.options.max_height,
            format = %payload.options.output_format,
        )
    )]
    pub async fn transcode_image(
        &self,
        payload: TranscodeImagePayload,
    ) -> Result<Output, TranscodeError> {
        let TranscodeImagePayload { source, options } = payload;

        let bitmap = codec::decode_bitmap(source, &self.fetcher).await?;
        let (width, height) = codec::scale_dimensions(
            bitmap.width(),
            bitmap.height(),
            options.max_width,
            options.max_height,
        );
        debug!(
            from_width = bitmap.width(),
            from_height = bitmap.height(),
            width,
            height,
            "scaled"
        );

        let target = EncodeTarget {
            width,
            height,
            format: options.output_format,
            quality: options.quality,
        };
        let binary = codec::encode_bitmap(bitmap, target, self.max_surface_pixels).await?;
        let text = binary.to_base64();
        Ok(Output::Transcoded { binary, text })
    }
}
