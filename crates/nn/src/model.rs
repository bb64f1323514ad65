// Copyright 2025 Irreducible Inc.

use std::fmt;

use stylenet_compute::KernelLayer;
use stylenet_math::{Activation, Window};
use stylenet_utils::ensure;
use tracing::{info, instrument};

use crate::{
	params::ParameterSource, BatchNormalization, Convolution2D, Deconvolution2D, Error,
	FeatureMap, Layer, ResidualBlock, ResidualBlockChained, TilePolicy, TileRemainder, Timings,
	DEFAULT_TILE_HEIGHT,
};

/// Styles for which trained parameters are published.
pub const MODEL_NAMES: [&str; 6] = [
	"composition",
	"seurat",
	"candy",
	"kanagawa",
	"starrynight",
	"fur",
];

pub const DEFAULT_MODEL: &str = "composition";

/// Channels of the input and output images.
pub const IMAGE_CHANNELS: usize = 3;

pub const RESIDUAL_BLOCKS: usize = 5;

pub const RESIDUAL_CHANNELS: usize = 128;

/// `(in_channels, out_channels, window)` of c1..c3.
const ENCODER: [(usize, usize, Window); 3] = [
	(IMAGE_CHANNELS, 32, Window::square(9, 1, 4)),
	(32, 64, Window::square(4, 2, 1)),
	(64, RESIDUAL_CHANNELS, Window::square(4, 2, 1)),
];

/// `(in_channels, out_channels, window)` of d1..d3.
const DECODER: [(usize, usize, Window); 3] = [
	(RESIDUAL_CHANNELS, 64, Window::square(4, 2, 1)),
	(64, 32, Window::square(4, 2, 1)),
	(32, IMAGE_CHANNELS, Window::square(9, 1, 4)),
];

/// Which layer implementations the model is assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelVariant {
	/// Whole-image layers and independent residual blocks.
	#[default]
	Reference,
	/// Row-tiled layers and the chained residual block.
	Tiled,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelConfig {
	pub variant: ModelVariant,
	/// Tile height in input rows; only used by [`ModelVariant::Tiled`].
	pub tile_height: usize,
	pub tile_remainder: TileRemainder,
	pub batch_norm_eps: f32,
}

impl Default for ModelConfig {
	fn default() -> Self {
		Self {
			variant: ModelVariant::Reference,
			tile_height: DEFAULT_TILE_HEIGHT,
			tile_remainder: TileRemainder::Partial,
			batch_norm_eps: 0.0,
		}
	}
}

impl ModelConfig {
	pub fn tiled() -> Self {
		Self {
			variant: ModelVariant::Tiled,
			..Default::default()
		}
	}

	pub fn tile_policy(&self) -> TilePolicy {
		match self.variant {
			ModelVariant::Reference => TilePolicy::Untiled,
			ModelVariant::Tiled => TilePolicy::Rows {
				height: self.tile_height,
				remainder: self.tile_remainder,
			},
		}
	}
}

enum ResidualStage<H: KernelLayer> {
	Independent(Vec<ResidualBlock<H>>),
	Chained(ResidualBlockChained<H>),
}

/// The style-transfer network: three convolutions, five residual blocks and three transposed
/// convolutions, every stage but the last followed by ELU and batch normalization.
pub struct StyleModel<H: KernelLayer> {
	config: ModelConfig,
	encoder: Vec<(Convolution2D<H>, BatchNormalization<H>)>,
	residual: ResidualStage<H>,
	decoder: Vec<(Deconvolution2D<H>, BatchNormalization<H>)>,
	output: Deconvolution2D<H>,
	loaded_model: Option<String>,
}

impl<H: KernelLayer> StyleModel<H> {
	/// Allocates every layer with zero parameters.
	pub fn new(hal: &H, config: ModelConfig) -> Result<Self, Error> {
		let policy = config.tile_policy();
		let eps = config.batch_norm_eps;

		let encoder = ENCODER
			.iter()
			.map(|&(in_channels, out_channels, window)| {
				let conv = Convolution2D::new(hal, in_channels, out_channels, window, policy)?
					.with_activation(Activation::Elu);
				Ok((conv, BatchNormalization::new(hal, out_channels, eps)?))
			})
			.collect::<Result<Vec<_>, Error>>()?;

		let residual = match config.variant {
			ModelVariant::Reference => ResidualStage::Independent(
				(0..RESIDUAL_BLOCKS)
					.map(|_| ResidualBlock::new(hal, RESIDUAL_CHANNELS, policy, eps))
					.collect::<Result<_, _>>()?,
			),
			ModelVariant::Tiled => ResidualStage::Chained(ResidualBlockChained::new(
				hal,
				RESIDUAL_CHANNELS,
				RESIDUAL_BLOCKS,
				policy,
				eps,
			)?),
		};

		let [hidden @ .., (in_channels, out_channels, window)] = DECODER;
		let decoder = hidden
			.iter()
			.map(|&(in_channels, out_channels, window)| {
				let deconv = Deconvolution2D::new(hal, in_channels, out_channels, window, policy)?
					.with_activation(Activation::Elu);
				Ok((deconv, BatchNormalization::new(hal, out_channels, eps)?))
			})
			.collect::<Result<Vec<_>, Error>>()?;
		let output = Deconvolution2D::new(hal, in_channels, out_channels, window, policy)?;

		Ok(Self {
			config,
			encoder,
			residual,
			decoder,
			output,
			loaded_model: None,
		})
	}

	pub fn config(&self) -> &ModelConfig {
		&self.config
	}

	pub fn is_loaded(&self) -> bool {
		self.loaded_model.is_some()
	}

	/// Name of the successfully loaded parameter set.
	pub fn loaded_model(&self) -> Option<&str> {
		self.loaded_model.as_deref()
	}

	/// Runs a `3 x height x width` image through the network.
	#[instrument(skip_all, name = "StyleModel::forward", level = "debug")]
	pub fn forward(
		&mut self,
		hal: &H,
		input: FeatureMap<H::Buffer>,
	) -> Result<FeatureMap<H::Buffer>, Error> {
		ensure!(self.is_loaded(), Error::NotLoaded);
		input.expect_channels(IMAGE_CHANNELS, "style model")?;

		let mut x = input;
		for (conv, norm) in &mut self.encoder {
			x = conv.process(hal, x)?;
			x = norm.process(hal, x)?;
		}
		x = match &mut self.residual {
			ResidualStage::Independent(blocks) => {
				for block in blocks {
					x = block.process(hal, x)?;
				}
				x
			}
			ResidualStage::Chained(chain) => chain.process(hal, x)?,
		};
		for (deconv, norm) in &mut self.decoder {
			x = deconv.process(hal, x)?;
			x = norm.process(hal, x)?;
		}
		self.output.process(hal, x)
	}

	/// Uploads a planar host image, runs the network and downloads the result together with its
	/// height and width.
	pub fn forward_host(
		&mut self,
		hal: &H,
		image: &[f32],
		height: usize,
		width: usize,
	) -> Result<(Vec<f32>, usize, usize), Error> {
		let input = FeatureMap::upload(hal, image, IMAGE_CHANNELS, height, width)?;
		let output = self.forward(hal, input)?;
		Ok((output.download(hal)?, output.height(), output.width()))
	}
}

impl<H: KernelLayer> Layer<H> for StyleModel<H> {
	/// Loads the parameter set named `path`, for instance `candy`.
	fn load_parameters<S>(&mut self, hal: &H, source: &S, path: &str) -> Result<(), Error>
	where
		S: ParameterSource + ?Sized,
	{
		self.loaded_model = None;

		for (i, (conv, norm)) in self.encoder.iter_mut().enumerate() {
			conv.load_parameters(hal, source, &format!("{path}/c{}", i + 1))?;
			norm.load_parameters(hal, source, &format!("{path}/b{}", i + 1))?;
		}
		match &mut self.residual {
			ResidualStage::Independent(blocks) => {
				for (i, block) in blocks.iter_mut().enumerate() {
					block.load_parameters(hal, source, &format!("{path}/r{}", i + 1))?;
				}
			}
			ResidualStage::Chained(chain) => chain.load_parameters(hal, source, path)?,
		}
		let norms_before = self.encoder.len();
		for (i, (deconv, norm)) in self.decoder.iter_mut().enumerate() {
			deconv.load_parameters(hal, source, &format!("{path}/d{}", i + 1))?;
			norm.load_parameters(hal, source, &format!("{path}/b{}", norms_before + i + 1))?;
		}
		self.output
			.load_parameters(hal, source, &format!("{path}/d{}", self.decoder.len() + 1))?;

		info!(model = path, variant = ?self.config.variant, "loaded model parameters");
		self.loaded_model = Some(path.to_string());
		Ok(())
	}

	fn process(
		&mut self,
		hal: &H,
		input: FeatureMap<H::Buffer>,
	) -> Result<FeatureMap<H::Buffer>, Error> {
		self.forward(hal, input)
	}

	fn accumulate_benchmark(&mut self, sink: &mut Timings) {
		for (conv, norm) in &mut self.encoder {
			conv.accumulate_benchmark(sink);
			norm.accumulate_benchmark(sink);
		}
		match &mut self.residual {
			ResidualStage::Independent(blocks) => {
				blocks.iter_mut().for_each(|block| block.accumulate_benchmark(sink))
			}
			ResidualStage::Chained(chain) => chain.accumulate_benchmark(sink),
		}
		for (deconv, norm) in &mut self.decoder {
			deconv.accumulate_benchmark(sink);
			norm.accumulate_benchmark(sink);
		}
		self.output.accumulate_benchmark(sink);
	}
}

impl<H: KernelLayer> fmt::Debug for StyleModel<H> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StyleModel")
			.field("config", &self.config)
			.field("loaded_model", &self.loaded_model)
			.finish_non_exhaustive()
	}
}
