use std::fmt;
use std::str::FromStr;

use burn::config::Config;
use burn::module::Module;
use burn::nn::gru::{Gru, GruConfig};
use burn::nn::{Dropout, DropoutConfig, Lstm, LstmConfig};
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::ForecastError;
use crate::utils::repeat_interleave;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    #[serde(rename = "LSTM", alias = "lstm")]
    Lstm,
    #[serde(rename = "GRU", alias = "gru")]
    Gru,
}

impl FromStr for CellType {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LSTM" | "lstm" => Ok(CellType::Lstm),
            "GRU" | "gru" => Ok(CellType::Gru),
            other => Err(ForecastError::UnknownCellType(other.to_string())),
        }
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellType::Lstm => f.write_str("LSTM"),
            CellType::Gru => f.write_str("GRU"),
        }
    }
}

/// Per-layer state of a [`StackedRecurrent`] network, each tensor `[N, H]`.
#[derive(Debug, Clone)]
pub enum RecurrentState<B: Backend> {
    /// `(cell, hidden)` pairs of gated-memory layers.
    Paired(Vec<(Tensor<B, 2>, Tensor<B, 2>)>),
    /// Hidden state of gated-reset layers.
    Single(Vec<Tensor<B, 2>>),
}

impl<B: Backend> RecurrentState<B> {
    pub fn num_layers(&self) -> usize {
        match self {
            RecurrentState::Paired(layers) => layers.len(),
            RecurrentState::Single(layers) => layers.len(),
        }
    }

    pub fn batch_size(&self) -> usize {
        match self {
            RecurrentState::Paired(layers) => layers.first().map_or(0, |(_, h)| h.dims()[0]),
            RecurrentState::Single(layers) => layers.first().map_or(0, |h| h.dims()[0]),
        }
    }

    /// Repeats every batch row `repeats` times, matching
    /// [`repeat_interleave`] on the batch inputs.
    pub fn repeat_along_batch(&self, repeats: usize) -> Self {
        match self {
            RecurrentState::Paired(layers) => RecurrentState::Paired(
                layers
                    .iter()
                    .map(|(c, h)| {
                        (
                            repeat_interleave(c.clone(), repeats),
                            repeat_interleave(h.clone(), repeats),
                        )
                    })
                    .collect(),
            ),
            RecurrentState::Single(layers) => RecurrentState::Single(
                layers
                    .iter()
                    .map(|h| repeat_interleave(h.clone(), repeats))
                    .collect(),
            ),
        }
    }
}

/// Runs a burn [`Gru`] one step at a time so the hidden state carries over
/// between steps and across calls. Returns all hidden states and the last one.
fn unroll_gru<B: Backend>(
    gru: &Gru<B>,
    x: Tensor<B, 3>,
    state: Option<Tensor<B, 2>>,
) -> (Tensor<B, 3>, Tensor<B, 2>) {
    let [batch, seq, d_input] = x.dims();
    let mut hidden: Option<Tensor<B, 3>> = state.map(|h| h.unsqueeze_dim(1));

    let mut outputs = Vec::with_capacity(seq);
    for t in 0..seq {
        let x_t = x.clone().slice([0..batch, t..t + 1, 0..d_input]);
        let h_t = gru.forward(x_t, hidden);
        outputs.push(h_t.clone());
        hidden = Some(h_t);
    }

    let outputs = Tensor::cat(outputs, 1);
    let [_, _, d_hidden] = outputs.dims();
    let last = outputs
        .clone()
        .slice([0..batch, seq - 1..seq, 0..d_hidden])
        .squeeze(1);

    (outputs, last)
}

/// Multi-layer recurrent network over `[N, S, D_in]` inputs.
///
/// Exactly one of `lstm` and `gru` holds the layers. Dropout is applied to the
/// outputs of every layer but the last.
#[derive(Module, Debug)]
pub struct StackedRecurrent<B: Backend> {
    lstm: Vec<Lstm<B>>,
    gru: Vec<Gru<B>>,
    dropout: Dropout,
    d_hidden: usize,
}

impl<B: Backend> StackedRecurrent<B> {
    pub fn cell_type(&self) -> CellType {
        if self.lstm.is_empty() {
            CellType::Gru
        } else {
            CellType::Lstm
        }
    }

    pub fn num_layers(&self) -> usize {
        self.lstm.len().max(self.gru.len())
    }

    pub fn d_hidden(&self) -> usize {
        self.d_hidden
    }

    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        state: Option<RecurrentState<B>>,
    ) -> (Tensor<B, 3>, RecurrentState<B>) {
        if let Some(state) = &state {
            assert_eq!(
                state.num_layers(),
                self.num_layers(),
                "recurrent state does not match the number of layers"
            );
        }

        match self.cell_type() {
            CellType::Lstm => {
                let mut layer_states = match state {
                    Some(RecurrentState::Paired(states)) => states.into_iter().map(Some).collect(),
                    Some(RecurrentState::Single(_)) => {
                        panic!("LSTM layers need (cell, hidden) states")
                    }
                    None => vec![None; self.lstm.len()],
                };

                let mut x = x;
                let mut final_states = Vec::with_capacity(self.lstm.len());
                for (i, (lstm, layer_state)) in self.lstm.iter().zip(layer_states.drain(..)).enumerate() {
                    let (cell_states, hidden_states) = lstm.forward(x, layer_state);
                    let [batch, seq, hidden] = hidden_states.dims();

                    let last_cell: Tensor<B, 2> = cell_states
                        .slice([0..batch, seq - 1..seq, 0..hidden])
                        .squeeze(1);
                    let last_hidden: Tensor<B, 2> = hidden_states
                        .clone()
                        .slice([0..batch, seq - 1..seq, 0..hidden])
                        .squeeze(1);
                    final_states.push((last_cell, last_hidden));

                    x = if i + 1 < self.lstm.len() {
                        self.dropout.forward(hidden_states)
                    } else {
                        hidden_states
                    };
                }

                (x, RecurrentState::Paired(final_states))
            }
            CellType::Gru => {
                let mut layer_states = match state {
                    Some(RecurrentState::Single(states)) => states.into_iter().map(Some).collect(),
                    Some(RecurrentState::Paired(_)) => panic!("GRU layers need hidden states"),
                    None => vec![None; self.gru.len()],
                };

                let mut x = x;
                let mut final_states = Vec::with_capacity(self.gru.len());
                for (i, (gru, layer_state)) in self.gru.iter().zip(layer_states.drain(..)).enumerate() {
                    let (outputs, last_hidden) = unroll_gru(gru, x, layer_state);
                    final_states.push(last_hidden);

                    x = if i + 1 < self.gru.len() {
                        self.dropout.forward(outputs)
                    } else {
                        outputs
                    };
                }

                (x, RecurrentState::Single(final_states))
            }
        }
    }
}

#[derive(Config, Debug)]
pub struct StackedRecurrentConfig {
    cell_type: CellType,
    d_input: usize,
    d_hidden: usize,

    #[config(default = 1)]
    num_layers: usize,

    #[config(default = 0.0)]
    dropout: f64,
}

impl StackedRecurrentConfig {
    pub fn init<B: Backend>(&self) -> StackedRecurrent<B> {
        assert!(self.num_layers > 0, "at least one recurrent layer is required");

        let layer_inputs =
            (0..self.num_layers).map(|i| if i == 0 { self.d_input } else { self.d_hidden });

        let (lstm, gru) = match self.cell_type {
            CellType::Lstm => (
                layer_inputs
                    .map(|d_input| LstmConfig::new(d_input, self.d_hidden, true).init())
                    .collect(),
                Vec::new(),
            ),
            CellType::Gru => (
                Vec::new(),
                layer_inputs
                    .map(|d_input| GruConfig::new(d_input, self.d_hidden, true).init())
                    .collect(),
            ),
        };

        StackedRecurrent {
            lstm,
            gru,
            dropout: DropoutConfig::new(self.dropout).init(),
            d_hidden: self.d_hidden,
        }
    }
}
