use crate::error::ConfigError;

/// Number of (color, piece type, square) combinations per king bucket.
pub const FEATURES_PER_BUCKET: usize = 768;

/// The data loader doubles the feature space with an in-check half.
pub const IN_CHECK_HALVES: usize = 2;

/// Size of the king-square bucket map handed to the producer.
pub const BUCKET_MAP_LEN: usize = 64;

pub const DEFAULT_HIDDEN_SIZE: usize = 128;
pub const DEFAULT_MAX_ACTIVE_FEATURES: usize = 32;
pub const DEFAULT_POLICY_OUTPUT_SIZE: usize = 1882;
pub const DEFAULT_MAX_MOVES_PER_POS: usize = 218;
pub const DEFAULT_BATCH_SIZE: usize = 16384;

/// To fit in i16: 33 * 5.48 * 181 <= 32767
pub const DEFAULT_FT_MAX_WEIGHT: f32 = 5.48;
pub const DEFAULT_FT_Q: i32 = 181;

/// King-square input buckets. Every square maps to one bucket in `0..count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBuckets {
    pub count: usize,
    pub map: [usize; BUCKET_MAP_LEN],
}

impl InputBuckets {
    pub fn single() -> Self {
        Self {
            count: 1,
            map: [0; BUCKET_MAP_LEN],
        }
    }

    pub fn new(count: usize, map: [usize; BUCKET_MAP_LEN]) -> Result<Self, ConfigError> {
        if count == 0 {
            return Err(ConfigError::Zero("bucket count"));
        }
        if let Some((square, &bucket)) = map.iter().enumerate().find(|(_, &b)| b >= count) {
            return Err(ConfigError::BucketOutOfRange {
                square,
                bucket,
                count,
            });
        }
        Ok(Self { count, map })
    }

    /// Parses a comma separated list of 64 bucket ids, one per square (A1..H8).
    pub fn parse(map: &str) -> Result<Self, ConfigError> {
        let values = map
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<usize>()
                    .map_err(|_| ConfigError::InvalidBucketMap(format!("not a number: {s}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let map: [usize; BUCKET_MAP_LEN] = values.as_slice().try_into().map_err(|_| {
            ConfigError::InvalidBucketMap(format!(
                "expected {} entries, got {}",
                BUCKET_MAP_LEN,
                values.len()
            ))
        })?;

        let count = map.iter().max().map_or(1, |&m| m + 1);
        Self::new(count, map)
    }
}

impl Default for InputBuckets {
    fn default() -> Self {
        Self::single()
    }
}

/// Shape of the network and of the batches that feed it.
///
/// Every kernel, the wire protocol and the export format derive their sizes
/// from this one struct, so producer and consumer only need to agree on it.
#[derive(Debug, Clone, PartialEq)]
pub struct NetConfig {
    pub buckets: InputBuckets,
    /// Accumulator width per perspective. Must be even: adjacent activations
    /// of the concatenated perspectives are multiplied pairwise.
    pub hidden_size: usize,
    pub max_active_features: usize,
    pub policy_output_size: usize,
    pub max_moves_per_pos: usize,
    pub batch_size: usize,
    /// Clamp bound (`W_MAX`) for feature transformer weights and biases.
    pub ft_max_weight: f32,
    /// Fixed-point scale (`Q`) used when exporting the feature transformer.
    pub ft_q: i32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            buckets: InputBuckets::single(),
            hidden_size: DEFAULT_HIDDEN_SIZE,
            max_active_features: DEFAULT_MAX_ACTIVE_FEATURES,
            policy_output_size: DEFAULT_POLICY_OUTPUT_SIZE,
            max_moves_per_pos: DEFAULT_MAX_MOVES_PER_POS,
            batch_size: DEFAULT_BATCH_SIZE,
            ft_max_weight: DEFAULT_FT_MAX_WEIGHT,
            ft_q: DEFAULT_FT_Q,
        }
    }
}

impl NetConfig {
    /// Number of weight rows in the feature transformer.
    pub fn input_size(&self) -> usize {
        FEATURES_PER_BUCKET * IN_CHECK_HALVES * self.buckets.count
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("hidden size", self.hidden_size),
            ("max active features", self.max_active_features),
            ("policy output size", self.policy_output_size),
            ("max moves per position", self.max_moves_per_pos),
            ("batch size", self.batch_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.hidden_size % 2 != 0 {
            return Err(ConfigError::OddHiddenSize(self.hidden_size));
        }

        // Indices travel as i16 on the wire
        let limits = [
            ("input size", self.input_size()),
            ("policy output size", self.policy_output_size),
            ("batch size", self.batch_size),
        ];
        for (name, value) in limits {
            if value > i16::MAX as usize + 1 {
                return Err(ConfigError::ExceedsWireWidth { name, value });
            }
        }

        if !(self.ft_max_weight > 0.0 && self.ft_max_weight.is_finite()) {
            return Err(ConfigError::InvalidClamp(self.ft_max_weight));
        }
        if self.ft_q <= 0 {
            return Err(ConfigError::Zero("quantization scale"));
        }

        // Worst case accumulator: every feature slot plus the bias at the clamp bound
        let worst = (self.max_active_features + 1) as f64
            * self.ft_max_weight as f64
            * self.ft_q as f64;
        if worst > i16::MAX as f64 {
            return Err(ConfigError::AccumulatorOverflow {
                worst,
                limit: i16::MAX,
            });
        }

        Ok(())
    }
}

/// Network shape options shared by the binaries.
#[derive(clap::Args, Debug, Clone)]
pub struct NetArgs {
    /// Accumulator width per perspective.
    #[arg(long, default_value_t = DEFAULT_HIDDEN_SIZE)]
    pub hidden_size: usize,

    /// Feature slots per perspective in each record.
    #[arg(long, default_value_t = DEFAULT_MAX_ACTIVE_FEATURES)]
    pub max_active_features: usize,

    /// Number of move slots of the policy head.
    #[arg(long, default_value_t = DEFAULT_POLICY_OUTPUT_SIZE)]
    pub policy_output_size: usize,

    /// Legal move slots per position in each record.
    #[arg(long, default_value_t = DEFAULT_MAX_MOVES_PER_POS)]
    pub max_moves_per_pos: usize,

    /// Positions per batch record.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Comma separated king-square bucket per square, A1 to H8. One bucket if omitted.
    #[arg(long)]
    pub bucket_map: Option<String>,

    /// Clamp bound for feature transformer weights and biases.
    #[arg(long, default_value_t = DEFAULT_FT_MAX_WEIGHT)]
    pub ft_max_weight: f32,

    /// Fixed-point scale of the exported feature transformer.
    #[arg(long, default_value_t = DEFAULT_FT_Q)]
    pub ft_q: i32,
}

impl NetArgs {
    /// Builds and validates the configuration.
    pub fn to_config(&self) -> Result<NetConfig, ConfigError> {
        let buckets = match &self.bucket_map {
            Some(map) => InputBuckets::parse(map)?,
            None => InputBuckets::single(),
        };

        let config = NetConfig {
            buckets,
            hidden_size: self.hidden_size,
            max_active_features: self.max_active_features,
            policy_output_size: self.policy_output_size,
            max_moves_per_pos: self.max_moves_per_pos,
            batch_size: self.batch_size,
            ft_max_weight: self.ft_max_weight,
            ft_q: self.ft_q,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = NetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.input_size(), 1536);
    }

    #[test]
    fn rejects_accumulator_overflow() {
        let config = NetConfig {
            ft_max_weight: 6.0,
            ..NetConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AccumulatorOverflow { .. })
        ));
    }

    #[test]
    fn rejects_odd_hidden_size() {
        let config = NetConfig {
            hidden_size: 15,
            ..NetConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OddHiddenSize(15))
        ));
    }

    #[test]
    fn parses_bucket_map() {
        let map = (0..64)
            .map(|sq| if sq % 8 > 3 { "1" } else { "0" })
            .collect::<Vec<_>>()
            .join(",");
        let buckets = InputBuckets::parse(&map).unwrap();
        assert_eq!(buckets.count, 2);
        assert_eq!(buckets.map[4], 1);
        assert_eq!(buckets.map[3], 0);

        assert!(InputBuckets::parse("0,1,2").is_err());
    }

    #[test]
    fn net_args_build_a_validated_config() {
        use clap::Parser;

        #[derive(Parser)]
        struct Cli {
            #[command(flatten)]
            net: NetArgs,
        }

        let cli = Cli::try_parse_from(["train", "--hidden-size", "64", "--batch-size", "1024"]).unwrap();
        let config = cli.net.to_config().unwrap();
        assert_eq!(config.hidden_size, 64);
        assert_eq!(config.batch_size, 1024);
        assert_eq!(config.buckets, InputBuckets::single());

        let cli = Cli::try_parse_from(["train", "--hidden-size", "63"]).unwrap();
        assert!(cli.net.to_config().is_err());
    }
}
