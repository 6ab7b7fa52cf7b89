//! Drives the `pxc-cell-transcode` binary over its stdio.

use std::process::Stdio;

use base64::Engine;
use cell_transcode_proto::{Output, RequestEnvelope, Response, Source, TranscodeOptions};
use cellwire::Connection;
use image::{ExtendedColorType, ImageEncoder, Rgb, RgbImage};
use tokio::process::{Child, Command};

fn spawn_cell() -> (Child, Connection<RequestEnvelope, Response>) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_pxc-cell-transcode"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let stdin = child.stdin.take().unwrap();
    let stdout = child.stdout.take().unwrap();
    (child, cellwire::socket::run(stdout, stdin))
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([10, 120, 250]));
    let mut out = Vec::new();
    image::codecs::png::PngEncoder::new(&mut out)
        .write_image(img.as_raw(), width, height, ExtendedColorType::Rgb8)
        .unwrap();
    out
}

#[tokio::test]
async fn test_cell_answers_and_exits_on_eof() {
    let (mut child, conn) = spawn_cell();

    let source = Source::Locator(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png(64, 32))
    ));
    let transcode = conn.request(RequestEnvelope::transcode_image(
        conn.next_id(),
        source,
        &TranscodeOptions::new(32, 32),
    ));
    let unknown = conn.request(RequestEnvelope::bare(conn.next_id(), "unknownThing"));
    let (transcode, unknown) = tokio::join!(transcode, unknown);

    let Ok(Output::Transcoded { binary, text }) = transcode.unwrap().result else {
        panic!("expected a transcode output");
    };
    assert_eq!(binary.content_type(), "image/jpeg");
    assert_eq!(text, binary.to_base64());
    let decoded = image::load_from_memory(binary.as_bytes()).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (32, 16));

    assert!(unknown.unwrap().error().unwrap().contains("unknownThing"));

    // Dropping the last handle closes stdin
    drop(conn);
    let status = child.wait().await.unwrap();
    assert!(status.success());
}
