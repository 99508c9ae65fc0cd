use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{FinetuneError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResNetArch {
    Resnet18,
    Resnet34,
    Resnet50,
    Resnet101,
}

impl ResNetArch {
    /// Residual blocks per stage.
    pub fn blocks(&self) -> [usize; 4] {
        match self {
            ResNetArch::Resnet18 => [2, 2, 2, 2],
            ResNetArch::Resnet34 => [3, 4, 6, 3],
            ResNetArch::Resnet50 => [3, 4, 6, 3],
            ResNetArch::Resnet101 => [3, 4, 23, 3],
        }
    }

    pub fn bottleneck(&self) -> bool {
        matches!(self, ResNetArch::Resnet50 | ResNetArch::Resnet101)
    }

    pub fn expansion(&self) -> usize {
        if self.bottleneck() {
            4
        } else {
            1
        }
    }
}

impl FromStr for ResNetArch {
    type Err = FinetuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "resnet18" => Ok(ResNetArch::Resnet18),
            "resnet34" => Ok(ResNetArch::Resnet34),
            "resnet50" => Ok(ResNetArch::Resnet50),
            "resnet101" => Ok(ResNetArch::Resnet101),
            _ => Err(FinetuneError::UnsupportedModel(s.to_string())),
        }
    }
}

impl fmt::Display for ResNetArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResNetArch::Resnet18 => "resnet18",
            ResNetArch::Resnet34 => "resnet34",
            ResNetArch::Resnet50 => "resnet50",
            ResNetArch::Resnet101 => "resnet101",
        };
        f.write_str(name)
    }
}

/// A slice of the classifier that is trained or frozen as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamGroup {
    Stem,
    Layer1,
    Layer2,
    Layer3,
    Layer4,
    Head,
}

impl ParamGroup {
    pub const ALL: [ParamGroup; 6] = [
        ParamGroup::Stem,
        ParamGroup::Layer1,
        ParamGroup::Layer2,
        ParamGroup::Layer3,
        ParamGroup::Layer4,
        ParamGroup::Head,
    ];
}

impl fmt::Display for ParamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamGroup::Stem => "stem",
            ParamGroup::Layer1 => "layer1",
            ParamGroup::Layer2 => "layer2",
            ParamGroup::Layer3 => "layer3",
            ParamGroup::Layer4 => "layer4",
            ParamGroup::Head => "head",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub arch: ResNetArch,
    /// Channel count of the stem; 64 for the standard networks.
    pub base_width: usize,
    pub num_classes: usize,
    /// Hidden width of a two-layer head. `None` gives dropout + linear.
    pub head_hidden: Option<usize>,
    pub dropout: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            arch: ResNetArch::Resnet50,
            base_width: 64,
            num_classes: 101,
            head_hidden: None,
            dropout: 0.5,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_width == 0 {
            return Err(FinetuneError::InvalidConfig("base_width must be > 0".into()));
        }
        if self.num_classes < 2 {
            return Err(FinetuneError::InvalidConfig("num_classes must be >= 2".into()));
        }
        if self.head_hidden == Some(0) {
            return Err(FinetuneError::InvalidConfig("head_hidden must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(FinetuneError::InvalidConfig("dropout must be within [0, 1)".into()));
        }
        Ok(())
    }

    /// Width of the pooled backbone output.
    pub fn feature_dim(&self) -> usize {
        self.base_width * 8 * self.arch.expansion()
    }

    /// Same backbone with a different classifier head size.
    pub fn with_num_classes(&self, num_classes: usize) -> Self {
        Self {
            num_classes,
            ..self.clone()
        }
    }
}

impl fmt::Display for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (width {}, {} classes, head {:?}, dropout {})",
            self.arch, self.base_width, self.num_classes, self.head_hidden, self.dropout
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupLr {
    pub group: ParamGroup,
    pub lr: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OptimizerConfig {
    Adam {
        #[serde(default)]
        weight_decay: Option<f32>,
    },
    Sgd {
        #[serde(default = "default_momentum")]
        momentum: f64,
        #[serde(default)]
        weight_decay: Option<f32>,
    },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adam { weight_decay: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SchedulerConfig {
    Constant,
    Step {
        step_size: usize,
        #[serde(default = "default_gamma")]
        gamma: f64,
    },
    Plateau {
        #[serde(default = "default_gamma")]
        factor: f64,
        #[serde(default = "default_patience")]
        patience: usize,
        #[serde(default = "default_threshold")]
        threshold: f64,
    },
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig::Constant
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    pub groups: Vec<GroupLr>,
    pub epochs: usize,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl PhaseConfig {
    pub fn trainable(&self) -> BTreeSet<ParamGroup> {
        self.groups.iter().map(|g| g.group).collect()
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(FinetuneError::InvalidConfig(msg));

        if self.epochs == 0 {
            return invalid(format!("phase {}: epochs must be > 0", self.name));
        }
        if self.groups.is_empty() {
            return invalid(format!("phase {}: no trainable groups", self.name));
        }
        if self.trainable().len() != self.groups.len() {
            return invalid(format!("phase {}: parameter group listed twice", self.name));
        }
        if let Some(bad) = self.groups.iter().find(|g| !(g.lr > 0.0)) {
            return invalid(format!("phase {}: lr for {} must be > 0", self.name, bad.group));
        }
        match &self.scheduler {
            SchedulerConfig::Step { step_size: 0, .. } => {
                return invalid(format!("phase {}: step_size must be > 0", self.name));
            }
            SchedulerConfig::Step { gamma, .. } | SchedulerConfig::Plateau { factor: gamma, .. }
                if !(*gamma > 0.0 && *gamma <= 1.0) =>
            {
                return invalid(format!("phase {}: decay factor must be within (0, 1]", self.name));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Checks each phase and that no phase freezes a group an earlier one trained.
pub fn validate_phases(phases: &[PhaseConfig]) -> Result<()> {
    if phases.is_empty() {
        return Err(FinetuneError::InvalidConfig("at least one phase is required".into()));
    }

    let mut seen = BTreeSet::new();
    for phase in phases {
        phase.validate()?;
        let trainable = phase.trainable();
        if let Some(group) = seen.difference(&trainable).next() {
            return Err(FinetuneError::ShrinkingPhase {
                phase: phase.name.clone(),
                group: *group,
            });
        }
        seen = trainable;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDataConfig {
    pub root: PathBuf,
    #[serde(default = "default_name_file")]
    pub name_file: String,
    #[serde(default = "default_train_list")]
    pub train_list: String,
    #[serde(default = "default_val_list")]
    pub val_list: String,
    #[serde(default = "default_test_list")]
    pub test_list: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Food101DataConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscriminatorDataConfig {
    pub food101: Food101DataConfig,
    pub local: LocalDataConfig,
    /// Train/val/test fractions applied to the Food-101 train split.
    #[serde(default = "default_fractions")]
    pub fractions: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataConfig {
    Local(LocalDataConfig),
    Food101(Food101DataConfig),
    Discriminator(DiscriminatorDataConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub image_size: u32,
    pub batch_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            batch_size: 32,
        }
    }
}

/// Start from the weights of an earlier checkpoint instead of a fresh init.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitConfig {
    pub checkpoint: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub checkpoint_dir: PathBuf,
    pub run_name: String,
    pub save_optimizer_state: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            run_name: "food".to_string(),
            save_optimizer_state: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    pub model: ModelConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub init: Option<InitConfig>,
    pub phases: Vec<PhaseConfig>,
    #[serde(default)]
    pub output: OutputConfig,
    /// Revert to the phase's best weights before the next phase starts.
    #[serde(default = "default_restore_best")]
    pub restore_best: bool,
}

impl ExperimentConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: ExperimentConfig =
            serde_json::from_str(&config_str).with_context(|| "Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        validate_phases(&self.phases)?;

        if self.loader.batch_size == 0 {
            return Err(FinetuneError::InvalidConfig("batch_size must be > 0".into()));
        }
        if self.loader.image_size < 32 {
            return Err(FinetuneError::InvalidConfig("image_size must be >= 32".into()));
        }
        if self.output.run_name.is_empty() {
            return Err(FinetuneError::InvalidConfig("run_name must not be empty".into()));
        }
        if let DataConfig::Discriminator(d) = &self.data {
            let sum: f64 = d.fractions.iter().sum();
            if d.fractions.iter().any(|f| *f <= 0.0) || (sum - 1.0).abs() > 1e-6 {
                return Err(FinetuneError::InvalidConfig(
                    "split fractions must be positive and sum to 1".into(),
                ));
            }
            if self.model.num_classes != 2 {
                return Err(FinetuneError::InvalidConfig(
                    "a dataset discriminator has exactly 2 classes".into(),
                ));
            }
        }
        Ok(())
    }
}

fn default_seed() -> u64 {
    42
}

fn default_restore_best() -> bool {
    true
}

fn default_momentum() -> f64 {
    0.9
}

fn default_gamma() -> f64 {
    0.1
}

fn default_patience() -> usize {
    3
}

fn default_threshold() -> f64 {
    1e-4
}

fn default_name_file() -> String {
    "name.txt".to_string()
}

fn default_train_list() -> String {
    "train_list.txt".to_string()
}

fn default_val_list() -> String {
    "val_list.txt".to_string()
}

fn default_test_list() -> String {
    "test_list.txt".to_string()
}

fn default_fractions() -> [f64; 3] {
    [0.7, 0.15, 0.15]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(name: &str, groups: &[(ParamGroup, f64)]) -> PhaseConfig {
        PhaseConfig {
            name: name.to_string(),
            groups: groups
                .iter()
                .map(|(group, lr)| GroupLr { group: *group, lr: *lr })
                .collect(),
            epochs: 2,
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }

    #[test]
    fn test_growing_phases_are_accepted() {
        let phases = vec![
            phase("head", &[(ParamGroup::Head, 1e-3)]),
            phase("top", &[(ParamGroup::Layer4, 1e-4), (ParamGroup::Head, 1e-3)]),
            phase(
                "full",
                &ParamGroup::ALL.iter().map(|g| (*g, 1e-5)).collect::<Vec<_>>(),
            ),
        ];
        assert!(validate_phases(&phases).is_ok());
    }

    #[test]
    fn test_shrinking_phase_is_rejected() {
        let phases = vec![
            phase("top", &[(ParamGroup::Layer4, 1e-4), (ParamGroup::Head, 1e-3)]),
            phase("head", &[(ParamGroup::Head, 1e-3)]),
        ];
        match validate_phases(&phases) {
            Err(FinetuneError::ShrinkingPhase { phase, group }) => {
                assert_eq!(phase, "head");
                assert_eq!(group, ParamGroup::Layer4);
            }
            other => panic!("expected ShrinkingPhase, got {:?}", other),
        }
    }

    #[test]
    fn test_phase_rejects_bad_lr_and_duplicates() {
        assert!(validate_phases(&[phase("a", &[(ParamGroup::Head, 0.0)])]).is_err());
        assert!(validate_phases(&[phase(
            "b",
            &[(ParamGroup::Head, 1e-3), (ParamGroup::Head, 1e-4)]
        )])
        .is_err());
        assert!(validate_phases(&[]).is_err());
    }

    #[test]
    fn test_arch_parsing() {
        assert_eq!("ResNet50".parse::<ResNetArch>().unwrap(), ResNetArch::Resnet50);
        assert!(matches!(
            "vgg16".parse::<ResNetArch>(),
            Err(FinetuneError::UnsupportedModel(name)) if name == "vgg16"
        ));
    }

    #[test]
    fn test_feature_dim() {
        let mut model = ModelConfig::default();
        assert_eq!(model.feature_dim(), 2048);
        model.arch = ResNetArch::Resnet18;
        assert_eq!(model.feature_dim(), 512);
    }

    #[test]
    fn test_parse_experiment_config() {
        let json = r#"{
            "model": { "arch": "resnet50", "num_classes": 208 },
            "data": { "kind": "local", "root": "data/release_data" },
            "phases": [
                { "name": "top", "epochs": 10,
                  "groups": [ { "group": "layer4", "lr": 1e-4 }, { "group": "head", "lr": 1e-3 } ],
                  "scheduler": { "kind": "plateau", "patience": 3 } },
                { "name": "full", "epochs": 15,
                  "groups": [ { "group": "stem", "lr": 1e-5 }, { "group": "layer1", "lr": 1e-5 },
                              { "group": "layer2", "lr": 1e-5 }, { "group": "layer3", "lr": 1e-4 },
                              { "group": "layer4", "lr": 1e-4 }, { "group": "head", "lr": 1e-3 } ],
                  "optimizer": { "kind": "sgd" },
                  "scheduler": { "kind": "step", "step_size": 7 } }
            ]
        }"#;

        let config: ExperimentConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.seed, 42);
        assert_eq!(config.loader.batch_size, 32);
        assert_eq!(config.model.dropout, 0.5);
        match &config.data {
            DataConfig::Local(local) => assert_eq!(local.val_list, "val_list.txt"),
            other => panic!("unexpected data config {:?}", other),
        }
        assert_eq!(
            config.phases[1].optimizer,
            OptimizerConfig::Sgd { momentum: 0.9, weight_decay: None }
        );
        assert_eq!(
            config.phases[1].scheduler,
            SchedulerConfig::Step { step_size: 7, gamma: 0.1 }
        );
    }

    #[test]
    fn test_discriminator_needs_two_classes() {
        let json = r#"{
            "model": { "arch": "resnet18", "num_classes": 5, "head_hidden": 512 },
            "data": { "kind": "discriminator",
                      "food101": { "root": "data/food-101" },
                      "local": { "root": "data/release_data" } },
            "phases": [ { "name": "head", "epochs": 5,
                          "groups": [ { "group": "head", "lr": 1e-3 } ] } ]
        }"#;
        let mut config: ExperimentConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
        config.model.num_classes = 2;
        assert!(config.validate().is_ok());
    }
}
