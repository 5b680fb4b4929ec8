use burn::tensor::{backend::Backend, BasicOps, Data, Int, Shape, Tensor};

/// Average of `x` along `dim` weighted by `weights`, keeping `dim`.
///
/// Entries with a zero weight are excluded even when `x` is not finite there,
/// and the weight sum is floored at one.
pub fn weighted_average<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    weights: Tensor<B, D>,
    dim: usize,
) -> Tensor<B, D> {
    let zeros = x.zeros_like();
    let mask = weights.clone().equal_elem(0.0).bool_not();
    let weighted = x * weights.clone();

    let weighted_tensor = zeros.mask_where(mask, weighted);
    let sum_weights = weights.sum_dim(dim).clamp_min(1.0);

    weighted_tensor.sum_dim(dim) / sum_weights
}

/// Repeats every entry of the leading axis `repeats` times in place, so row
/// `i` of the input becomes rows `i * repeats .. (i + 1) * repeats`.
pub fn repeat_interleave<B: Backend, const D: usize, K: BasicOps<B>>(
    x: Tensor<B, D, K>,
    repeats: usize,
) -> Tensor<B, D, K> {
    let dims = x.dims();
    let rest: usize = dims[1..].iter().product();

    let mut repeated = dims;
    repeated[0] = dims[0] * repeats;

    x.reshape([dims[0], 1, rest])
        .repeat(1, repeats)
        .reshape(repeated)
}

pub fn float_tensor<B: Backend, const D: usize>(values: Vec<f32>, shape: [usize; D]) -> Tensor<B, D> {
    let data = Data::new(values, Shape::new(shape));
    Tensor::from_data(data.convert())
}

pub fn int_tensor<B: Backend, const D: usize>(values: Vec<i64>, shape: [usize; D]) -> Tensor<B, D, Int> {
    let data = Data::new(values, Shape::new(shape));
    Tensor::from_data(data.convert())
}

/// Copies a float tensor back to the host as `f32` values in row-major order.
pub fn to_vec<B: Backend, const D: usize>(x: Tensor<B, D>) -> Vec<f32> {
    x.into_data().convert::<f32>().value
}
