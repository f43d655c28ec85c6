pub mod attention;
pub mod cross_attention;
pub mod mask;
pub mod mlp;

pub use attention::CausalSelfAttention;
pub use cross_attention::CrossAttention;
pub use mask::causal_mask;
pub use mlp::Mlp;
