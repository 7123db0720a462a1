use crate::result::Result;
use anyhow::{ensure, Context};
use byteorder::{BigEndian, ReadBytesExt};
use curl::easy::Easy;
use flate2::read::GzDecoder;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{s, Array, Array1, Array4, ArrayView1, ArrayView4};
use std::{
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// The kind of Mnist.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MnistKind {
    /// [MNIST](<http://yann.lecun.com/exdb/mnist/>)
    Digits,
    /// [FashionMNIST](<https://github.com/zalandoresearch/fashion-mnist>)
    Fashion,
}

impl MnistKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Digits => "mnist",
            Self::Fashion => "fashion-mnist",
        }
    }
    fn url(&self, file_name: &str) -> String {
        match self {
            Self::Digits => {
                format!("https://storage.googleapis.com/cvdf-datasets/mnist/{file_name}.gz")
            }
            Self::Fashion => format!(
                "http://fashion-mnist.s3-website.eu-central-1.amazonaws.com/{file_name}.gz"
            ),
        }
    }
}

/// Mnist builder.
pub mod builders {
    use super::{Mnist, MnistKind, Result};
    use std::path::PathBuf;

    /// Mnist builder.
    #[derive(Debug)]
    pub struct MnistBuilder {
        pub(super) path: Option<PathBuf>,
        pub(super) kind: MnistKind,
        pub(super) download: bool,
    }

    impl Default for MnistBuilder {
        fn default() -> Self {
            Self {
                path: None,
                kind: MnistKind::Digits,
                download: false,
            }
        }
    }

    impl MnistBuilder {
        /// The path to load the dataset from.
        ///
        /// This is the folder the files will be downloaded to / loaded from. If not specified, uses the OS specific "Downloads" directory or the "Temp" directory.
        pub fn path(self, path: impl Into<PathBuf>) -> Self {
            Self {
                path: Some(path.into()),
                ..self
            }
        }
        /// The kind of Mnist to use. Defaults to [`MnistKind::Digits`] (ie the original MNIST dataset).
        pub fn kind(self, kind: MnistKind) -> Self {
            Self { kind, ..self }
        }
        /// Whether to download the data. Defaults to false.
        pub fn download(self, download: bool) -> Self {
            Self { download, ..self }
        }
        /// Builds the dataset.
        ///
        /// **Errors**
        /// - The download failed.
        /// - The files were not found.
        /// - Decompressing / loading the data failed.
        pub fn build(&self) -> Result<Mnist> {
            Mnist::build(self)
        }
    }
}
use builders::MnistBuilder;

const FILE_NAMES: [&str; 4] = [
    "train-images-idx3-ubyte",
    "train-labels-idx1-ubyte",
    "t10k-images-idx3-ubyte",
    "t10k-labels-idx1-ubyte",
];

const TRAIN_LEN: usize = 60_000;
const TEST_LEN: usize = 10_000;

/// The MNIST dataset.
#[derive(Clone, Debug)]
pub struct Mnist {
    kind: MnistKind,
    images: Array4<u8>,
    classes: Array1<u8>,
    train_len: usize,
}

impl Mnist {
    /// Returns an [`MnistBuilder`] used to specify options.
    pub fn builder() -> MnistBuilder {
        MnistBuilder::default()
    }
    /// Creates a dataset from arrays, the first `train_len` samples are the training set.
    ///
    /// **Errors**
    /// - The number of images and classes differ.
    /// - `train_len` exceeds the number of samples.
    pub fn from_arrays(images: Array4<u8>, classes: Array1<u8>, train_len: usize) -> Result<Self> {
        ensure!(
            images.dim().0 == classes.len(),
            "{} images but {} classes!",
            images.dim().0,
            classes.len()
        );
        ensure!(train_len <= classes.len());
        Ok(Self {
            kind: MnistKind::Digits,
            images,
            classes,
            train_len,
        })
    }
    fn build(builder: &MnistBuilder) -> Result<Self> {
        let mnist_path = builder
            .path
            .clone()
            .unwrap_or_else(|| dirs::download_dir().unwrap_or_else(std::env::temp_dir))
            .join(builder.kind.name());
        if builder.download {
            fs::create_dir_all(&mnist_path)?;
            for name in FILE_NAMES.iter() {
                let path = gz_path(&mnist_path, name);
                if !path.exists() {
                    download(&builder.kind.url(name), &path)?;
                }
            }
        }
        let mut images = Vec::with_capacity((TRAIN_LEN + TEST_LEN) * 28 * 28);
        let mut classes = Vec::with_capacity(TRAIN_LEN + TEST_LEN);
        for name in FILE_NAMES.iter() {
            let (train, image) = match *name {
                "train-images-idx3-ubyte" => (true, true),
                "train-labels-idx1-ubyte" => (true, false),
                "t10k-images-idx3-ubyte" => (false, true),
                "t10k-labels-idx1-ubyte" => (false, false),
                _ => unreachable!(),
            };
            let n = if train { TRAIN_LEN } else { TEST_LEN };
            let path = gz_path(&mnist_path, name);
            let file = File::open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            debug!(path = %path.display(), "loading");
            let data = read_idx(GzDecoder::new(file), n, image)
                .with_context(|| format!("failed to load {}", path.display()))?;
            if image {
                images.extend(data);
            } else {
                classes.extend(data);
            }
        }
        ensure!(classes.iter().all(|c| *c < 10));
        let len = classes.len();
        let images = Array::from_shape_vec([len, 1, 28, 28], images)?;
        let classes = Array::from_shape_vec([len], classes)?;
        info!(kind = ?builder.kind, samples = len, "loaded mnist");
        Ok(Self {
            kind: builder.kind,
            images,
            classes,
            train_len: TRAIN_LEN,
        })
    }
    /// The kind.
    pub fn kind(&self) -> MnistKind {
        self.kind
    }
    /// The images.
    ///
    /// Shape = \[70_000, 1, 28, 28\].
    pub fn images(&self) -> &Array4<u8> {
        &self.images
    }
    /// The classes.
    ///
    /// Shape = \[70_000\].
    ///
    /// The classes range from 0 to 9 inclusive.
    pub fn classes(&self) -> &Array1<u8> {
        &self.classes
    }
    /// The training images and classes.
    pub fn train(&self) -> (ArrayView4<u8>, ArrayView1<u8>) {
        (
            self.images.slice(s![..self.train_len, .., .., ..]),
            self.classes.slice(s![..self.train_len]),
        )
    }
    /// The test images and classes.
    pub fn test(&self) -> (ArrayView4<u8>, ArrayView1<u8>) {
        (
            self.images.slice(s![self.train_len.., .., .., ..]),
            self.classes.slice(s![self.train_len..]),
        )
    }
}

fn gz_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name).with_extension("gz")
}

/// Reads an idx file with `n` items.
fn read_idx(mut reader: impl Read, n: usize, image: bool) -> Result<Vec<u8>> {
    let magic = if image { 2_051 } else { 2_049 };
    ensure!(reader.read_i32::<BigEndian>()? == magic, "bad magic number!");
    ensure!(reader.read_i32::<BigEndian>()? == n as i32, "expected {n} items!");
    if image {
        ensure!(reader.read_i32::<BigEndian>()? == 28);
        ensure!(reader.read_i32::<BigEndian>()? == 28);
    }
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    let len = if image { n * 28 * 28 } else { n };
    ensure!(
        data.len() == len,
        "expected {len} bytes, found {}!",
        data.len()
    );
    Ok(data)
}

fn download(url: &str, path: &Path) -> Result<()> {
    info!(url, "downloading");
    let style = ProgressStyle::default_bar()
        .template("{msg} [{bar}] {bytes:>9}/{total_bytes:9} [eta: {eta}]")?
        .progress_chars("=> ");
    let file_name = path
        .file_name()
        .map(|x| x.to_string_lossy().into_owned())
        .unwrap_or_default();
    let bar = ProgressBar::new(0).with_style(style).with_message(file_name);
    let mut bytes = Vec::new();
    let mut easy = Easy::new();
    easy.url(url)?;
    easy.follow_location(true)?;
    easy.fail_on_error(true)?;
    easy.progress(true)?;
    {
        let mut transfer = easy.transfer();
        transfer.write_function(|data| {
            bytes.extend_from_slice(data);
            Ok(data.len())
        })?;
        transfer.progress_function(|total, done, _, _| {
            bar.set_length(total as u64);
            bar.set_position(done as u64);
            true
        })?;
        transfer
            .perform()
            .with_context(|| format!("download of {url} failed"))?;
    }
    bar.finish();
    fs::write(path, bytes)?;
    Ok(())
}
