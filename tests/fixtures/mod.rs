//! Request payloads and generated room photos.

#![allow(dead_code)]

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};

/// Solid-colour PNG standing in for a room photo.
pub fn room_png(width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image::RgbImage::from_pixel(width, height, image::Rgb([200, 180, 160]))
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

pub fn data_uri(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", STANDARD.encode(png))
}

pub fn stage_body(image: &str) -> Value {
    json!({
        "image": image,
        "roomType": "living_room",
        "designStyle": "scandinavian",
        "variantCount": 2
    })
}

pub fn succeeded_webhook(provider_job_id: &str) -> Value {
    json!({
        "id": provider_job_id,
        "status": "succeeded",
        "output": ["https://cdn.example.com/a.png", "https://cdn.example.com/b.png"]
    })
}

pub fn failed_webhook(provider_job_id: &str, error: &str) -> Value {
    json!({ "id": provider_job_id, "status": "failed", "error": error })
}
