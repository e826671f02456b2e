mod mock;
mod openai;
mod traits;

pub use mock::ScriptedProvider;
pub use openai::OpenAIProvider;
pub use traits::*;
