pub mod api;
pub mod chat_template;
pub mod exec;
pub mod grounding;
pub mod literal;
pub mod models;
pub mod position_embed;
pub mod tokenizer;
pub mod utils;
