pub mod activation;
pub mod rnn;
