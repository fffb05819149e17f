//! 二维码渲染：黑白模块 + 4 模块宽的静默区，每个模块按配置放大。

use image::{GrayImage, Luma};
use qrcode::QrCode;

use super::ComposeError;

const QUIET_ZONE_MODULES: u32 = 4;

/// 将文本（通常是最终图片的 URL）渲染为灰度二维码图像。
pub fn render_qr(data: &str, module_pixels: u32) -> Result<GrayImage, ComposeError> {
    let code = QrCode::new(data.as_bytes())
        .map_err(|e| ComposeError::QrPersistFailed(format!("二维码编码失败：{}", e)))?;

    let scale = module_pixels.max(1);
    let module_count = code.width() as u32;
    let side = (module_count + QUIET_ZONE_MODULES * 2) * scale;
    let mut img = GrayImage::from_pixel(side, side, Luma([255u8]));

    for (i, color) in code.to_colors().iter().enumerate() {
        if *color != qrcode::Color::Dark {
            continue;
        }

        let x = (i as u32 % module_count + QUIET_ZONE_MODULES) * scale;
        let y = (i as u32 / module_count + QUIET_ZONE_MODULES) * scale;
        for dy in 0..scale {
            for dx in 0..scale {
                img.put_pixel(x + dx, y + dy, Luma([0u8]));
            }
        }
    }

    Ok(img)
}
