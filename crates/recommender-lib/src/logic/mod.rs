//! Estimation and post-processing of recommendations

mod estimator;
mod postprocess;
mod recommender;

pub use estimator::{
    ConfidenceMultiplier, MarginEstimator, MinResourcesEstimator, PercentileEstimator,
    ResourceEstimator,
};
pub use postprocess::{
    CappingPostProcessor, IntegerCpuPostProcessor, PostProcessor, PostProcessorChain,
    INTEGER_CPU_ANNOTATION_PREFIX, INTEGER_CPU_ANNOTATION_SUFFIX,
};
pub use recommender::{PodResourceRecommender, RecommenderParams};
