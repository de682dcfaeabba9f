use std::{collections::HashMap, fmt, fs, path::Path};

use anyhow::{bail, Context, Result};
use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{Dataset, InMemDataset},
    },
    prelude::*,
};
use image::{imageops::FilterType, ImageReader, RgbImage};
use ndarray::Array2;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Trainval,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Trainval => "trainval",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One annotated image. `labels` and `weights` hold one entry per class.
#[derive(Debug, Clone)]
pub struct VocItem {
    pub image: RgbImage,
    pub labels: Vec<u8>,
    pub weights: Vec<u8>,
}

pub struct VocDataset {
    pub dataset: InMemDataset<VocItem>,
    labels: Array2<f32>,
    weights: Array2<f32>,
}

impl Dataset<VocItem> for VocDataset {
    fn get(&self, index: usize) -> Option<VocItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl VocDataset {
    /// Loads a VOC split from `data_dir` (the `VOC2007` directory).
    ///
    /// Image ids come from `ImageSets/Main/<split>.txt`, per-class flags from
    /// `ImageSets/Main/<class>_<split>.txt`, pixels from `JPEGImages/<id>.jpg`
    /// resized to `image_size` squared.
    pub fn load(
        data_dir: &Path,
        class_names: &[&str],
        split: Split,
        image_size: u32,
    ) -> Result<Self> {
        let main_dir = data_dir.join("ImageSets").join("Main");
        let ids = read_image_ids(&main_dir.join(format!("{split}.txt")))?;

        let class_flags: Vec<HashMap<String, i8>> = class_names
            .iter()
            .map(|name| read_class_flags(&main_dir.join(format!("{name}_{split}.txt"))))
            .collect::<Result<_>>()?;

        let image_dir = data_dir.join("JPEGImages");
        let items: Vec<VocItem> = ids
            .par_iter()
            .map(|id| -> Result<VocItem> {
                let (labels, weights) = class_flags
                    .iter()
                    .zip(class_names)
                    .map(|(flags, name)| -> Result<(u8, u8)> {
                        let flag = flags.get(id).with_context(|| {
                            format!("image {id} is missing from the {name} list of split {split}")
                        })?;
                        annotation(*flag)
                    })
                    .collect::<Result<Vec<_>>>()?
                    .into_iter()
                    .unzip();

                let path = image_dir.join(format!("{id}.jpg"));
                let image = ImageReader::open(&path)
                    .with_context(|| format!("failed to open {}", path.display()))?
                    .decode()
                    .with_context(|| format!("failed to decode {}", path.display()))?
                    .resize_exact(image_size, image_size, FilterType::Triangle)
                    .to_rgb8();

                Ok(VocItem {
                    image,
                    labels,
                    weights,
                })
            })
            .collect::<Result<_>>()?;

        let shape = (items.len(), class_names.len());
        let labels =
            Array2::from_shape_fn(shape, |(index, class)| items[index].labels[class] as f32);
        let weights =
            Array2::from_shape_fn(shape, |(index, class)| items[index].weights[class] as f32);

        Ok(VocDataset {
            dataset: InMemDataset::new(items),
            labels,
            weights,
        })
    }

    /// Ground-truth labels and weights as `[N, C]` matrices, in dataset order.
    pub fn targets(&self) -> (Array2<f32>, Array2<f32>) {
        (self.labels.clone(), self.weights.clone())
    }
}

fn read_image_ids(path: &Path) -> Result<Vec<String>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

fn read_class_flags(path: &Path) -> Result<HashMap<String, i8>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| -> Result<(String, i8)> {
            let mut fields = line.split_whitespace();
            let (Some(id), Some(flag)) = (fields.next(), fields.next()) else {
                bail!("malformed line {} in {}", number + 1, path.display());
            };
            let flag = flag.parse::<i8>().with_context(|| {
                format!("invalid flag on line {} in {}", number + 1, path.display())
            })?;
            Ok((id.to_string(), flag))
        })
        .collect()
}

/// Maps a VOC presence flag to `(label, weight)`. Difficult objects (flag 0)
/// count as present but carry no weight.
fn annotation(flag: i8) -> Result<(u8, u8)> {
    match flag {
        1 => Ok((1, 1)),
        -1 => Ok((0, 1)),
        0 => Ok((1, 0)),
        other => bail!("unknown annotation flag {other}"),
    }
}

#[derive(Clone, Debug)]
pub struct VocBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 2>,
    pub weights: Tensor<B, 2>,
}

#[derive(Clone)]
pub struct VocBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> VocBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    fn row(&self, values: &[u8]) -> Tensor<B, 2> {
        let data = TensorData::new(values.to_vec(), [values.len()]).convert::<B::FloatElem>();
        Tensor::<B, 1>::from_data(data, &self.device).unsqueeze()
    }
}

impl<B: Backend> Batcher<VocItem, VocBatch<B>> for VocBatcher<B> {
    fn batch(&self, items: Vec<VocItem>) -> VocBatch<B> {
        let images = items
            .iter()
            .map(|item| {
                let (width, height) = item.image.dimensions();
                TensorData::new(
                    item.image.as_raw().clone(),
                    [height as usize, width as usize, 3],
                )
                .convert::<B::FloatElem>()
            })
            .map(|data| Tensor::<B, 3>::from_data(data, &self.device))
            // HWC -> CHW
            .map(|tensor| tensor.permute([2, 0, 1]).unsqueeze::<4>())
            .map(|tensor| tensor / 255.)
            .collect();

        let labels = items.iter().map(|item| self.row(&item.labels)).collect();
        let weights = items.iter().map(|item| self.row(&item.weights)).collect();

        VocBatch {
            images: Tensor::cat(images, 0),
            labels: Tensor::cat(labels, 0),
            weights: Tensor::cat(weights, 0),
        }
    }
}
