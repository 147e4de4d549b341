use rten::FloatOperators;
use rten_tensor::prelude::*;
use rten_tensor::{NdTensor, NdTensorView};
use thiserror::Error;

/// View of an image's pixels, in either (height, width, channels) or (channels,
/// height, width) order.
pub enum ImagePixels<'a> {
    /// Pixel values in the range [0, 1]
    Floats(NdTensorView<'a, f32, 3>),
    /// Pixel values in the range [0, 255]
    Bytes(NdTensorView<'a, u8, 3>),
}

impl<'a> From<NdTensorView<'a, f32, 3>> for ImagePixels<'a> {
    fn from(value: NdTensorView<'a, f32, 3>) -> Self {
        ImagePixels::Floats(value)
    }
}

impl<'a> From<NdTensorView<'a, u8, 3>> for ImagePixels<'a> {
    fn from(value: NdTensorView<'a, u8, 3>) -> Self {
        ImagePixels::Bytes(value)
    }
}

impl ImagePixels<'_> {
    fn shape(&self) -> [usize; 3] {
        match self {
            ImagePixels::Floats(f) => f.shape(),
            ImagePixels::Bytes(b) => b.shape(),
        }
    }

    /// Return the pixel value at an index as a value in [0, 1].
    fn pixel_as_f32(&self, index: [usize; 3]) -> f32 {
        match self {
            ImagePixels::Floats(f) => f[index],
            ImagePixels::Bytes(b) => b[index] as f32 / 255.,
        }
    }
}

/// Errors that can occur when creating an [ImageSource].
#[derive(Error, Clone, Debug, PartialEq)]
pub enum ImageSourceError {
    /// The image channel count is not 1 (greyscale), 3 (RGB) or 4 (RGBA).
    #[error("channel count is not 1, 3 or 4")]
    UnsupportedChannelCount,
    /// The image data length is not a multiple of the channel size.
    #[error("data length is not a multiple of `width * height`")]
    InvalidDataLength,
}

/// Specifies the order in which pixels are laid out in an image tensor.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DimOrder {
    /// Channels last order. This is the order used by the
    /// [image](https://github.com/image-rs/image) crate and HTML Canvas APIs.
    Hwc,
    /// Channels first order. This is the order used by many machine-learning
    /// libraries for image tensors.
    Chw,
}

/// View of an image, for use with
/// [HtrEngine::prepare_input](crate::HtrEngine::prepare_input).
pub struct ImageSource<'a> {
    data: ImagePixels<'a>,
    order: DimOrder,
}

impl<'a> ImageSource<'a> {
    /// Create an image source from a buffer of pixels in HWC order.
    ///
    /// An image loaded using the `image` crate can be converted to an
    /// [ImageSource] using:
    ///
    /// ```no_run
    /// use scrawl::ImageSource;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let image = image::open("word.png")?.into_rgb8();
    /// let img_source = ImageSource::from_bytes(image.as_raw(), image.dimensions())?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_bytes(
        bytes: &'a [u8],
        dimensions: (u32, u32),
    ) -> Result<ImageSource<'a>, ImageSourceError> {
        let (width, height) = dimensions;
        let channel_len = (width * height) as usize;

        if channel_len == 0 {
            return Err(ImageSourceError::UnsupportedChannelCount);
        }

        if bytes.len() % channel_len != 0 {
            return Err(ImageSourceError::InvalidDataLength);
        }

        let channels = bytes.len() / channel_len;
        Self::from_tensor(
            NdTensorView::from_data([height as usize, width as usize, channels], bytes),
            DimOrder::Hwc,
        )
    }

    /// Create an image source from a tensor of bytes (`u8`) or floats (`f32`),
    /// in either channels-first (CHW) or channels-last (HWC) order.
    pub fn from_tensor<T>(
        data: NdTensorView<'a, T, 3>,
        order: DimOrder,
    ) -> Result<ImageSource<'a>, ImageSourceError>
    where
        NdTensorView<'a, T, 3>: Into<ImagePixels<'a>>,
    {
        let channels = match order {
            DimOrder::Hwc => data.size(2),
            DimOrder::Chw => data.size(0),
        };
        match channels {
            1 | 3 | 4 => Ok(ImageSource {
                data: data.into(),
                order,
            }),
            _ => Err(ImageSourceError::UnsupportedChannelCount),
        }
    }

    /// Return the shape of the image as a `[channels, height, width]` array.
    pub(crate) fn shape(&self) -> [usize; 3] {
        let shape = self.data.shape();

        match self.order {
            DimOrder::Chw => shape,
            DimOrder::Hwc => [shape[2], shape[0], shape[1]],
        }
    }

    /// Return the pixel from a given channel and spatial coordinate, as a
    /// float in [0, 1].
    pub(crate) fn get_pixel(&self, channel: usize, y: usize, x: usize) -> f32 {
        let index = match self.order {
            DimOrder::Chw => [channel, y, x],
            DimOrder::Hwc => [y, x, channel],
        };
        self.data.pixel_as_f32(index)
    }
}

/// Default width of recognition model inputs, before transposition.
pub const DEFAULT_INPUT_WIDTH: usize = 128;

/// Default height of recognition model inputs, before transposition.
pub const DEFAULT_INPUT_HEIGHT: usize = 32;

/// Value used for padding around the resized image.
pub const PAD_VALUE: f32 = 0.;

/// Convert an image to a `[height, width]` greyscale tensor with values in
/// [0, 1].
///
/// RGB inputs are converted using the ITU BT.601 luma weights, which is what
/// TensorFlow's `rgb_to_grayscale` and libpng use. The alpha channel of RGBA
/// inputs is ignored.
pub fn prepare_image(img: ImageSource) -> NdTensor<f32, 2> {
    let [chans, height, width] = img.shape();
    assert!(
        matches!(chans, 1 | 3 | 4),
        "expected greyscale, RGB or RGBA input image"
    );

    let used_chans = chans.min(3); // For RGBA images, only RGB channels are used
    let chan_weights: &[f32] = if chans == 1 {
        &[1.]
    } else {
        &[0.299, 0.587, 0.114]
    };

    let mut grey_img = NdTensor::zeros([height, width]);
    for y in 0..height {
        for x in 0..width {
            let mut pixel = 0.;
            for (chan, weight) in (0..used_chans).zip(chan_weights) {
                pixel += img.get_pixel(chan, y, x) * weight
            }
            grey_img[[y, x]] = pixel;
        }
    }
    grey_img
}

/// Default size of image encoder inputs, as (height, width).
pub const DEFAULT_GENERATOR_INPUT_HW: [usize; 2] = [384, 384];

/// Mean subtracted from pixel values when preparing image encoder inputs.
pub const RGB_NORM_MEAN: f32 = 0.5;

/// Standard deviation that image encoder inputs are scaled by.
pub const RGB_NORM_STD: f32 = 0.5;

/// Prepare an image for a ViT-style image encoder.
///
/// The image is converted to RGB, stretched to `size_hw` and normalized with
/// [RGB_NORM_MEAN] and [RGB_NORM_STD], giving a `[1, 3, height, width]`
/// tensor with values in [-1, 1]. Greyscale images are copied to all three
/// channels. The alpha channel of RGBA images is ignored.
pub fn prepare_rgb_image(
    img: ImageSource,
    size_hw: [usize; 2],
) -> anyhow::Result<NdTensor<f32, 4>> {
    let [chans, height, width] = img.shape();

    let mut rgb = NdTensor::zeros([1, 3, height, width]);
    for chan in 0..3 {
        let src_chan = if chans == 1 { 0 } else { chan };
        for y in 0..height {
            for x in 0..width {
                rgb[[0, chan, y, x]] = img.get_pixel(src_chan, y, x);
            }
        }
    }

    let [out_height, out_width] = size_hw;
    let resized: NdTensor<f32, 4> = if [height, width] == size_hw {
        rgb
    } else {
        rgb.view()
            .resize_image(size_hw)?
            .into_shape([1, 3, out_height, out_width])
    };

    Ok(resized.map(|x| (x - RGB_NORM_MEAN) / RGB_NORM_STD))
}

/// Placement of a resized image within a padded canvas.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PadGeometry {
    /// Size of the image after aspect-preserving resizing, as (height, width).
    pub resized_hw: [usize; 2],

    /// Offset of the resized image's top-left corner, as (top, left).
    pub offset_hw: [usize; 2],
}

/// Compute how an image of size `src_hw` is scaled and centered to fit
/// `target_hw` without distortion.
///
/// The rounding rules match TensorFlow's `tf.image.resize_with_pad`. The
/// scaled size is floored, while the padding before the image is half of
/// the difference between the target and the unrounded scaled size, rounded
/// down.
pub fn pad_geometry(src_hw: [usize; 2], target_hw: [usize; 2]) -> PadGeometry {
    let [src_h, src_w] = src_hw.map(|x| x.max(1) as f64);
    let [target_h, target_w] = target_hw.map(|x| x as f64);

    let ratio = (src_w / target_w).max(src_h / target_h);
    let [resized_h, resized_w] = [src_h / ratio, src_w / ratio];

    let size = |resized: f64, target: f64| (resized.floor() as usize).clamp(1, target as usize);
    let offset = |resized: f64, target: f64| ((target - resized) / 2.).floor().max(0.) as usize;

    PadGeometry {
        resized_hw: [size(resized_h, target_h), size(resized_w, target_w)],
        offset_hw: [offset(resized_h, target_h), offset(resized_w, target_w)],
    }
}

/// Resize a greyscale image to fit `target_hw`, preserving the aspect ratio,
/// and pad the remaining area with [PAD_VALUE].
pub fn resize_with_pad(
    grey: &NdTensor<f32, 2>,
    target_hw: [usize; 2],
) -> anyhow::Result<NdTensor<f32, 2>> {
    let [height, width] = grey.shape();
    let PadGeometry {
        resized_hw: [resized_h, resized_w],
        offset_hw: [top, left],
    } = pad_geometry([height, width], target_hw);

    let resized = grey
        .reshaped([1, 1, height, width])
        .resize_image([resized_h, resized_w])?;
    let resized_shape = [resized.size(2), resized.size(3)];
    let resized: NdTensor<f32, 2> = resized.into_shape(resized_shape);

    let mut padded = NdTensor::full(target_hw, PAD_VALUE);
    for y in 0..resized_h {
        for x in 0..resized_w {
            padded[[top + y, left + x]] = resized[[y, x]];
        }
    }
    Ok(padded)
}

/// Convert a padded `[height, width]` image into an NHWC batch of one image
/// in the orientation the recognition model expects.
///
/// The model reads text as a sequence along its second axis, so the image is
/// transposed to `[width, height]` and then flipped along the new second axis.
/// Element `[0, x, j, 0]` of the output is `image[height - 1 - j, x]`.
pub fn to_model_input(image: NdTensorView<f32, 2>) -> NdTensor<f32, 4> {
    let [height, width] = image.shape();
    let mut output = NdTensor::zeros([1, width, height, 1]);
    for x in 0..width {
        for j in 0..height {
            output[[0, x, j, 0]] = image[[height - 1 - j, x]];
        }
    }
    output
}
