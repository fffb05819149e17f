//! # 边框合成模块
//!
//! ## 设计思路
//!
//! 生成结果按固定偏移、原始尺寸贴到与边框同尺寸的透明画布上，
//! 再以边框自身的 alpha 作为蒙版覆盖在最上层，最后压平为不透明 RGB。
//! 边框的镂空窗口需要按这个固定位置设计，这里不做任何动态对齐。
//!
//! 没有边框素材时直接压平生成结果。

use image::{DynamicImage, GenericImageView, Rgb, RgbImage, Rgba, RgbaImage, imageops};

/// 生成最终要落盘的不透明图像。
///
/// 生成图超出画布的部分会被静默裁掉。
pub fn composite_with_frame(
    generated: &DynamicImage,
    frame: Option<&DynamicImage>,
    offset: (u32, u32),
) -> RgbImage {
    let Some(frame) = frame else {
        return generated.to_rgb8();
    };

    let frame_rgba = frame.to_rgba8();
    let (frame_width, frame_height) = frame_rgba.dimensions();
    let (photo_width, photo_height) = generated.dimensions();

    if offset.0.saturating_add(photo_width) > frame_width
        || offset.1.saturating_add(photo_height) > frame_height
    {
        log::warn!(
            "⚠️ 生成图超出边框画布，超出部分将被裁剪 - 生成图: {}x{} 偏移: ({}, {}) 边框: {}x{}",
            photo_width,
            photo_height,
            offset.0,
            offset.1,
            frame_width,
            frame_height
        );
    }

    let mut canvas = RgbaImage::new(frame_width, frame_height);
    imageops::replace(
        &mut canvas,
        &generated.to_rgba8(),
        offset.0 as i64,
        offset.1 as i64,
    );

    blend_with_own_alpha(&mut canvas, &frame_rgba);
    flatten_dropping_alpha(&canvas)
}

/// 以 `overlay` 的 alpha 作为蒙版，把它混合到 `base` 上（四个通道都参与混合）。
fn blend_with_own_alpha(base: &mut RgbaImage, overlay: &RgbaImage) {
    for (x, y, top) in overlay.enumerate_pixels() {
        let mask = top.0[3] as u32;
        if mask == 0 {
            continue;
        }

        let dst = base.get_pixel_mut(x, y);
        if mask == 255 {
            *dst = *top;
            continue;
        }

        let inv = 255 - mask;
        let mut blended = [0u8; 4];
        for (channel, value) in blended.iter_mut().enumerate() {
            *value = ((top.0[channel] as u32 * mask + dst.0[channel] as u32 * inv + 127) / 255) as u8;
        }
        *dst = Rgba(blended);
    }
}

fn flatten_dropping_alpha(canvas: &RgbaImage) -> RgbImage {
    RgbImage::from_fn(canvas.width(), canvas.height(), |x, y| {
        let p = canvas.get_pixel(x, y);
        Rgb([p.0[0], p.0[1], p.0[2]])
    })
}
