pub mod generator;
pub mod grounding;
pub mod knowledge_base;
pub mod retriever;
pub mod scripts;
pub mod testcases;

pub use generator::{build_generator, Generator, GroqGenerator, OllamaGenerator};
pub use grounding::{Citation, GroundedChunk, GroundingContext, GroundingContextBuilder};
pub use knowledge_base::{Answer, BuildReport, IndexStats, KnowledgeBase};
pub use retriever::{CancelFlag, Retriever};
pub use scripts::{extract_html_selectors, GeneratedScript, HtmlSelectors, SelectorCounts};
pub use testcases::{TestCase, TestCaseReport};
