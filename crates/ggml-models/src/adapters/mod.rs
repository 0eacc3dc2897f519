pub(crate) mod helpers;
mod chatglm;
mod chatglm2;
mod chatglm4v;

pub use chatglm::ChatGlmAdapter;
pub use chatglm2::{ChatGlm2Adapter, ChatGlm3Adapter, ChatGlm4Adapter};
pub use chatglm4v::ChatGlm4VAdapter;
