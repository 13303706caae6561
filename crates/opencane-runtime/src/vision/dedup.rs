//! Perceptual hashing for near-duplicate image detection.
//!
//! A 64-bit dHash catches re-uploads of visually identical frames; a content
//! hash catches exact byte duplicates even when the image cannot be decoded.

use sha2::{Digest, Sha256};

/// 64-bit difference hash over a 9x8 grayscale downscale. Empty when the
/// image cannot be decoded.
pub fn compute_dhash(image_bytes: &[u8]) -> Option<u64> {
    let img = image::load_from_memory(image_bytes).ok()?;
    let gray = img
        .grayscale()
        .resize_exact(9, 8, image::imageops::FilterType::Triangle)
        .to_luma8();
    let mut bits: u64 = 0;
    for y in 0..8 {
        for x in 0..8 {
            bits <<= 1;
            if gray.get_pixel(x, y).0[0] > gray.get_pixel(x + 1, y).0[0] {
                bits |= 1;
            }
        }
    }
    Some(bits)
}

pub fn dhash_hex(hash: u64) -> String {
    format!("{hash:016x}")
}

pub fn parse_dhash(value: &str) -> Option<u64> {
    u64::from_str_radix(value.trim(), 16).ok()
}

/// Truncated SHA-256 of the raw bytes, for exact-duplicate detection.
pub fn content_hash(image_bytes: &[u8]) -> String {
    let digest = Sha256::digest(image_bytes);
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Whether `candidate` is within `max_distance` bits of any prior hash.
pub fn is_near_duplicate<'a>(
    candidate: u64,
    priors: impl IntoIterator<Item = &'a str>,
    max_distance: u32,
) -> bool {
    priors
        .into_iter()
        .filter_map(parse_dhash)
        .any(|prior| hamming_distance(candidate, prior) <= max_distance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(shade: u8) -> Vec<u8> {
        // A tiny gradient so the dhash has structure; `shade` shifts it.
        let img = image::RgbImage::from_fn(16, 16, |x, _y| {
            image::Rgb([shade.saturating_add((x * 10) as u8), 0, 0])
        });
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn identical_bytes_have_zero_distance() {
        let bytes = png_bytes(10);
        let a = compute_dhash(&bytes).unwrap();
        let b = compute_dhash(&bytes).unwrap();
        assert_eq!(hamming_distance(a, b), 0);
        assert_eq!(content_hash(&bytes), content_hash(&bytes));
    }

    #[test]
    fn similar_images_are_near_duplicates() {
        let a = compute_dhash(&png_bytes(10)).unwrap();
        let b = compute_dhash(&png_bytes(12)).unwrap();
        assert!(hamming_distance(a, b) <= 8);
        assert!(is_near_duplicate(b, [dhash_hex(a).as_str()], 8));
    }

    #[test]
    fn garbage_bytes_yield_no_dhash_but_a_content_hash() {
        assert!(compute_dhash(b"not an image").is_none());
        assert_eq!(content_hash(b"not an image").len(), 32);
    }

    #[test]
    fn dhash_hex_roundtrip() {
        let hash = 0xDEAD_BEEF_0123_4567u64;
        assert_eq!(parse_dhash(&dhash_hex(hash)), Some(hash));
        assert_eq!(parse_dhash("zz"), None);
    }
}
