//! # 变换流水线模块
//!
//! ## 设计思路
//!
//! 集中管理上传照片与场景素材在外部调用前的所有确定性变换：
//! 长边限制、按画布高度比例适配、场景归一化、PNG 编码。
//! 这些步骤只为控制外部调用的内存与带宽成本，不承担美学职责。
//!
//! ## 实现思路
//!
//! 1. 先用纯整数运算计算目标尺寸，保证“不放大”“长边恰好等于上限”
//! 2. 优先使用 `fast_image_resize` 执行卷积缩放
//! 3. 失败时回退 `image::resize_exact`
//! 4. 保持输入的通道模型（RGB 仍为 RGB，RGBA 仍为 RGBA）

use fast_image_resize as fr;
use image::{DynamicImage, GenericImageView, ImageBuffer, ImageFormat, Rgb, Rgba};
use std::io::Cursor;

use super::{ComposeConfig, ComposeError};

/// 比例适配后主体宽度相对画布宽度的上限倍数。
const MAX_FITTED_WIDTH_FACTOR: u64 = 4;

/// 计算长边受限后的尺寸。
///
/// 长边不超过 `bound` 时原样返回；否则长边等于 `bound`，短边按比例向下取整（至少 1）。
pub fn bounded_dimensions(width: u32, height: u32, bound: u32) -> (u32, u32) {
    let longer = width.max(height);
    if bound == 0 || longer <= bound {
        return (width, height);
    }

    let scale_side =
        |side: u32| (((side as u64) * (bound as u64)) / (longer as u64)).max(1) as u32;

    if width >= height {
        (bound, scale_side(height))
    } else {
        (scale_side(width), bound)
    }
}

/// 计算“高度 = 比例 × 画布高度”时的目标尺寸，保持宽高比。
pub fn fitted_dimensions(width: u32, height: u32, canvas_height: u32, fraction: f32) -> (u32, u32) {
    let target_height = ((canvas_height as f64) * (fraction as f64)).round().max(1.0) as u32;
    let target_width = ((width as f64) * (target_height as f64) / (height.max(1) as f64))
        .round()
        .max(1.0) as u32;
    (target_width, target_height)
}

/// 限制主体长边。
pub fn bound_subject(image: DynamicImage, config: &ComposeConfig) -> Result<DynamicImage, ComposeError> {
    let (width, height) = image.dimensions();
    let (target_width, target_height) =
        bounded_dimensions(width, height, config.max_subject_dimension);

    if (target_width, target_height) == (width, height) {
        return Ok(image);
    }

    log::info!(
        "🧩 主体长边限制：{}x{} -> {}x{}（filter={:?}）",
        width,
        height,
        target_width,
        target_height,
        config.resize_filter
    );

    resize_image(&image, target_width, target_height, config.resize_filter)
}

/// 按配置的画布高度比例重新缩放主体；未配置比例时原样返回。
pub fn fit_subject_to_canvas(
    image: DynamicImage,
    config: &ComposeConfig,
) -> Result<DynamicImage, ComposeError> {
    let Some(fraction) = config.subject_height_fraction else {
        return Ok(image);
    };

    let (width, height) = image.dimensions();
    ensure_fittable(width, height, config)?;
    let (target_width, target_height) =
        fitted_dimensions(width, height, config.canvas_height, fraction);

    if (target_width, target_height) == (width, height) {
        return Ok(image);
    }

    log::debug!(
        "📐 主体比例适配：{}x{} -> {}x{}（fraction={}）",
        width,
        height,
        target_width,
        target_height,
        fraction
    );

    resize_image(&image, target_width, target_height, config.resize_filter)
}

/// 检查主体在比例适配后宽度不超过画布宽度的固定倍数；未配置比例时总是通过。
///
/// 背景移除不改变尺寸，因此可以在任何外部调用之前判定。
pub(crate) fn ensure_fittable(width: u32, height: u32, config: &ComposeConfig) -> Result<(), ComposeError> {
    let Some(fraction) = config.subject_height_fraction else {
        return Ok(());
    };

    let (target_width, _) = fitted_dimensions(width, height, config.canvas_height, fraction);
    let max_width = (config.canvas_width as u64) * MAX_FITTED_WIDTH_FACTOR;
    if (target_width as u64) > max_width {
        return Err(ComposeError::InvalidImageInput(format!(
            "图片宽高比过于极端：{}x{} 适配后宽度 {} 超过上限 {}",
            width, height, target_width, max_width
        )));
    }

    Ok(())
}

/// 将场景强制缩放到生成画布尺寸并转为不透明 RGB。
///
/// 不做留边处理，源图宽高比与画布不一致时接受形变。
pub fn normalize_scene(image: DynamicImage, config: &ComposeConfig) -> Result<DynamicImage, ComposeError> {
    let opaque = DynamicImage::ImageRgb8(image.to_rgb8());
    let (width, height) = opaque.dimensions();

    if (width, height) == (config.canvas_width, config.canvas_height) {
        return Ok(opaque);
    }

    resize_image(
        &opaque,
        config.canvas_width,
        config.canvas_height,
        config.resize_filter,
    )
}

/// 编码为 PNG 字节，供外部服务上传使用。
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, ComposeError> {
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, ImageFormat::Png)
        .map_err(|e| ComposeError::Internal(format!("PNG 编码失败：{}", e)))?;
    Ok(cursor.into_inner())
}

/// 缩放到精确尺寸，保持输入的通道模型。
pub fn resize_image(
    image: &DynamicImage,
    target_width: u32,
    target_height: u32,
    filter: image::imageops::FilterType,
) -> Result<DynamicImage, ComposeError> {
    match resize_with_fast_image_resize(image, target_width, target_height, filter) {
        Ok(resized) => Ok(resized),
        Err(err) => {
            log::warn!(
                "⚠️ fast_image_resize 缩放失败，回退 image::resize_exact：{}",
                err
            );
            Ok(image.resize_exact(target_width, target_height, filter))
        }
    }
}

fn resize_with_fast_image_resize(
    image: &DynamicImage,
    target_width: u32,
    target_height: u32,
    filter: image::imageops::FilterType,
) -> Result<DynamicImage, ComposeError> {
    let (src_width, src_height) = image.dimensions();
    let has_alpha = image.color().has_alpha();

    let (pixel_type, raw) = if has_alpha {
        (fr::PixelType::U8x4, image.to_rgba8().into_raw())
    } else {
        (fr::PixelType::U8x3, image.to_rgb8().into_raw())
    };

    let src_image = fr::images::Image::from_vec_u8(src_width, src_height, raw, pixel_type)
        .map_err(|e| ComposeError::Internal(format!("构建源图像缓冲失败：{}", e)))?;

    let mut dst_image = fr::images::Image::new(target_width, target_height, pixel_type);

    let mut resizer = fr::Resizer::new();
    let options = fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(to_fast_filter(filter)));

    resizer
        .resize(&src_image, &mut dst_image, Some(&options))
        .map_err(|e| ComposeError::Internal(format!("fast_image_resize 执行失败：{}", e)))?;

    let buffer = dst_image.into_vec();
    if has_alpha {
        ImageBuffer::<Rgba<u8>, Vec<u8>>::from_raw(target_width, target_height, buffer)
            .map(DynamicImage::ImageRgba8)
            .ok_or_else(|| ComposeError::Internal("fast_image_resize 输出缓冲长度异常".to_string()))
    } else {
        ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(target_width, target_height, buffer)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| ComposeError::Internal("fast_image_resize 输出缓冲长度异常".to_string()))
    }
}

fn to_fast_filter(filter: image::imageops::FilterType) -> fr::FilterType {
    match filter {
        image::imageops::FilterType::Nearest => fr::FilterType::Box,
        image::imageops::FilterType::Triangle => fr::FilterType::Bilinear,
        image::imageops::FilterType::CatmullRom => fr::FilterType::CatmullRom,
        image::imageops::FilterType::Gaussian => fr::FilterType::Mitchell,
        image::imageops::FilterType::Lanczos3 => fr::FilterType::Lanczos3,
    }
}
