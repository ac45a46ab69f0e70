use crate::error::Result;
use candle_core::{DType, Device, Tensor};
use image::{imageops, imageops::FilterType, DynamicImage};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_IMAGE_SIZE: u32 = 224;

/// Memory layout of the batched image tensor handed to the models.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `(1, size, size, 3)`, as exported from Keras.
    #[default]
    Nhwc,
    /// `(1, 3, size, size)`.
    Nchw,
}

/// Decodes by content, so the file extension does not matter.
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    decode_image(&fs::read(path)?)
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    Ok(image::load_from_memory(bytes)?)
}

/// Converts to RGB, resizes to `size`x`size`, scales to `[0, 1]` and adds a batch dimension.
pub fn image_to_tensor(
    img: &DynamicImage,
    size: u32,
    layout: TensorLayout,
    device: &Device,
) -> Result<Tensor> {
    let side = size as usize;
    let rgb = img.to_rgb8();
    let data = imageops::resize(&rgb, size, size, FilterType::CatmullRom).into_raw();
    let tensor = Tensor::from_vec(data, (side, side, 3), device)?
        .to_dtype(DType::F32)?
        .affine(1.0 / 255.0, 0.0)?;
    let tensor = match layout {
        TensorLayout::Nhwc => tensor,
        TensorLayout::Nchw => tensor.permute((2, 0, 1))?.contiguous()?,
    };
    Ok(tensor.unsqueeze(0)?)
}

pub fn preprocess_path(
    path: &Path,
    size: u32,
    layout: TensorLayout,
    device: &Device,
) -> Result<Tensor> {
    image_to_tensor(&load_image(path)?, size, layout, device)
}
