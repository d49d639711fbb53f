/// Scale 16-bit luminance samples to 8-bit gray using the frame's response factor
///
/// Science data is usually delivered as raw 16-bit counts. Multiplying by the
/// calibration/response factor maps the useful range into [0, 255]; values
/// outside saturate.
pub fn luma16_to_gray8(samples: &[u16], response: f32) -> Vec<u8> {
    let response = if response.is_finite() && response > 0.0 {
        response
    } else {
        log::warn!("Invalid response factor {}, using 1.0", response);
        1.0
    };

    samples
        .iter()
        .map(|&v| (v as f32 * response).round().clamp(0.0, 255.0) as u8)
        .collect()
}

/// Convert interleaved f32 samples in [0.0, 1.0] to interleaved RGBA8
///
/// # Arguments
/// * `samples` - Interleaved samples, `channels` values per pixel
/// * `channels` - 1 (gray), 2 (gray + alpha), 3 (RGB) or 4 (RGBA)
/// * `width` - Image width in pixels
/// * `height` - Image height in pixels
///
/// # Returns
/// Vec<u8> containing RGBA8 data in interleaved format (RGBARGBARGBA...)
pub fn interleaved_f32_to_rgba8(samples: &[f32], channels: usize, width: usize, height: usize) -> Vec<u8> {
    let mut rgba = vec![0u8; width * height * 4];

    if !(1..=4).contains(&channels) || samples.len() < width * height * channels {
        log::warn!(
            "Insufficient samples for {}x{} image with {} channels",
            width,
            height,
            channels
        );
        return rgba;
    }

    let to_u8 = |v: f32| (v * 255.0).clamp(0.0, 255.0) as u8;

    for (pixel, out) in samples.chunks_exact(channels).zip(rgba.chunks_exact_mut(4)) {
        match channels {
            1 => {
                let gray = to_u8(pixel[0]);
                out.copy_from_slice(&[gray, gray, gray, 255]);
            }
            2 => {
                let gray = to_u8(pixel[0]);
                out.copy_from_slice(&[gray, gray, gray, to_u8(pixel[1])]);
            }
            3 => {
                out.copy_from_slice(&[to_u8(pixel[0]), to_u8(pixel[1]), to_u8(pixel[2]), 255]);
            }
            _ => {
                out.copy_from_slice(&[
                    to_u8(pixel[0]),
                    to_u8(pixel[1]),
                    to_u8(pixel[2]),
                    to_u8(pixel[3]),
                ]);
            }
        }
    }

    rgba
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_conversion() {
        // 2x2 RGB: red 1.0, green 0.5, blue 0.0 everywhere
        let samples: Vec<f32> = [1.0_f32, 0.5, 0.0].repeat(4);
        let rgba = interleaved_f32_to_rgba8(&samples, 3, 2, 2);

        assert_eq!(rgba[0], 255); // R
        assert_eq!(rgba[1], 127); // G
        assert_eq!(rgba[2], 0); // B
        assert_eq!(rgba[3], 255); // A
        assert_eq!(rgba.len(), 2 * 2 * 4);
    }

    #[test]
    fn test_grayscale_conversion() {
        let samples = vec![0.5_f32; 4];
        let rgba = interleaved_f32_to_rgba8(&samples, 1, 2, 2);

        assert_eq!(&rgba[0..4], &[127, 127, 127, 255]);
    }

    #[test]
    fn test_short_input_yields_blank() {
        let rgba = interleaved_f32_to_rgba8(&[1.0; 3], 3, 2, 2);
        assert!(rgba.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_luma16_saturates() {
        let gray = luma16_to_gray8(&[0, 100, 60000], 1.0);
        assert_eq!(gray, vec![0, 100, 255]);

        // Nonsense response falls back to identity
        assert_eq!(luma16_to_gray8(&[7], f32::NAN), vec![7]);
    }
}
