// problem.rs — Reconstruction problems and where their inputs come from.
//
// A `Problem` names one reference image and its ordered source images.
// Pixels and cameras are fetched through `ImageSource`, so the state
// manager does not care whether they live in a dense folder on disk or
// were synthesised in memory by a test.
//
// Dense folder layout:
//
//   <dense>/images/<%08d>.jpg       intensity, decoded to 8-bit gray
//   <dense>/cams/<%08d>_cam.txt     camera text file (see camera.rs)

use std::path::{Path, PathBuf};

use crate::camera::Camera;
use crate::error::{DataError, Result};
use crate::image::Image;

/// One reference image plus the source images it is matched against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub ref_image_id: u32,
    pub src_image_ids: Vec<u32>,
    /// Longest allowed image side; larger inputs are shrunk to fit.
    pub cur_image_size: u32,
}

impl Problem {
    pub fn new(ref_image_id: u32, src_image_ids: Vec<u32>, cur_image_size: u32) -> Self {
        Problem {
            ref_image_id,
            src_image_ids,
            cur_image_size,
        }
    }

    /// Reference id followed by the source ids, in load order.
    pub fn image_ids(&self) -> impl Iterator<Item = u32> + '_ {
        std::iter::once(self.ref_image_id).chain(self.src_image_ids.iter().copied())
    }

    /// Number of images including the reference.
    pub fn num_images(&self) -> usize {
        1 + self.src_image_ids.len()
    }
}

/// Supplies intensity images and cameras by image id.
pub trait ImageSource {
    /// Single-channel intensity in 0..255.
    fn load_image(&self, image_id: u32) -> Result<Image<f32>>;

    /// Camera as stored, before any rescaling.
    fn load_camera(&self, image_id: u32) -> Result<Camera>;
}

/// An on-disk dense folder.
#[derive(Debug, Clone)]
pub struct DenseFolder {
    root: PathBuf,
}

impl DenseFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DenseFolder { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_path(&self, image_id: u32) -> PathBuf {
        self.root.join("images").join(format!("{image_id:08}.jpg"))
    }

    pub fn camera_path(&self, image_id: u32) -> PathBuf {
        self.root.join("cams").join(format!("{image_id:08}_cam.txt"))
    }
}

impl ImageSource for DenseFolder {
    fn load_image(&self, image_id: u32) -> Result<Image<f32>> {
        let path = self.image_path(image_id);
        load_gray(&path)
    }

    fn load_camera(&self, image_id: u32) -> Result<Camera> {
        Camera::from_file(&self.camera_path(image_id))
    }
}

/// Decode any image file the `image` crate understands to gray f32 (0..255).
pub fn load_gray(path: &Path) -> Result<Image<f32>> {
    let img = image::open(path)
        .map_err(|e| match e {
            image::ImageError::IoError(io) => DataError::io(path, io),
            other => DataError::ImageDecode {
                path: path.to_path_buf(),
                message: other.to_string(),
            },
        })?
        .to_luma8();
    let (w, h) = img.dimensions();
    let data: Vec<f32> = img.into_raw().into_iter().map(f32::from).collect();
    Ok(Image::from_vec(w as usize, h as usize, data))
}
