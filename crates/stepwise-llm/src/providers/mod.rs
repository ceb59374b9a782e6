pub mod echo;
pub mod openai;

pub use echo::EchoClient;
pub use openai::OpenAiClient;
