pub mod timegrad;
