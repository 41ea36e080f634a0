pub mod fanout;

pub use fanout::FanoutService;
