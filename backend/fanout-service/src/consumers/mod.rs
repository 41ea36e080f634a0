pub mod fanout_consumer;

pub use fanout_consumer::FanoutConsumer;
