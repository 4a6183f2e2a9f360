mod anthropic;
mod error_handling;
mod google;
mod openai;
mod responses;
mod routing;
