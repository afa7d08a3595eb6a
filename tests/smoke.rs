use quantsim::nn::{BatchNorm2d, Conv2d, Flatten, Linear, MaxPool2d, Module, ReLU, Sequential};
use quantsim::{ConvGeometry, Tape, Tensor};
use rand::{rngs::StdRng, SeedableRng};

#[inline]
fn s(t: &Tensor) -> f32 {
    t.data()[0]
}

macro_rules! g {
    ($t:expr) => {
        $t.grad().map(|t| t.data()[0]).unwrap_or(0.0)
    };
}

#[test]
fn mul_grads() {
    Tape::reset();
    let x = Tensor::scalar(2.0).requires_grad();
    let y = Tensor::scalar(3.0).requires_grad();
    let z = &x * &y;
    z.backward();

    assert!((s(&z) - 6.0).abs() < 1e-6);
    assert!((g!(x) - 3.0).abs() < 1e-6);
    assert!((g!(y) - 2.0).abs() < 1e-6);
}

#[test]
fn compound_affine() {
    Tape::reset();
    let a = Tensor::scalar(2.0).requires_grad();
    let b = Tensor::scalar(3.0).requires_grad();
    let c = &a * &b + &a; // c = a*b + a
    c.backward();

    assert!((s(&c) - 8.0).abs() < 1e-6);
    assert!((g!(a) - 4.0).abs() < 1e-6); // b + 1
    assert!((g!(b) - 2.0).abs() < 1e-6); // a
}

#[test]
fn matmul_shapes_and_grads() {
    Tape::reset();

    // [2x3] @ [3x2] -> [2x2]
    let a = Tensor::new(vec![1., 2., 3., 4., 5., 6.], &[2, 3]).requires_grad();
    let b = Tensor::new(vec![7., 8., 9., 10., 11., 12.], &[3, 2]).requires_grad();

    let c = a.matmul(&b);
    assert_eq!(c.shape(), &[2, 2]);

    c.sum().backward();

    let ga = a.grad().unwrap();
    let gb = b.grad().unwrap();
    assert_eq!(ga.shape(), &[2, 3]);
    assert_eq!(gb.shape(), &[3, 2]);

    // expected C (row-major): [[58, 64], [139, 154]]
    let cd = c.data();
    assert!((cd[0] - 58.0).abs() < 1e-4);
    assert!((cd[3] - 154.0).abs() < 1e-4);
    // dL/dA[0,0] = B[0,0] + B[0,1]
    assert!((ga.data()[0] - 15.0).abs() < 1e-4);
}

#[test]
fn test_reshape_gradients() {
    Tape::reset();
    let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).requires_grad();
    let y = x.reshape(&[3, 2]);
    assert_eq!(y.shape(), &[3, 2]);
    assert_eq!(y.to_vec(), x.to_vec());

    y.sum().backward();
    assert_eq!(x.grad().unwrap().to_vec(), vec![1.0; 6]);
}

#[test]
fn test_relu_gradient_masks_negatives() {
    Tape::reset();
    let x = Tensor::new(vec![-1.0, 0.0, 2.0], &[3]).requires_grad();
    let y = x.relu();
    assert_eq!(y.to_vec(), vec![0.0, 0.0, 2.0]);
    y.sum().backward();
    assert_eq!(x.grad().unwrap().to_vec(), vec![0.0, 0.0, 1.0]);
}

#[test]
fn test_small_convnet_forward_backward() {
    Tape::reset();
    let mut rng = StdRng::seed_from_u64(42);
    let conv = Conv2d::new_with(&mut rng, 1, 3, (3, 3), ConvGeometry::default().with_padding((1, 1)), true);
    let weight = conv.weight.clone();
    let model = Sequential::new(vec![
        Box::new(conv),
        Box::new(BatchNorm2d::new(3)),
        Box::new(ReLU),
        Box::new(MaxPool2d::new(2, 2, 0)),
        Box::new(Flatten),
        Box::new(Linear::new_with(&mut rng, 3 * 2 * 2, 2, true)),
    ]);

    let x = Tensor::randn_with(&mut rng, &[4, 1, 4, 4]);
    let y = model.forward(&x);
    assert_eq!(y.shape(), &[4, 2]);

    y.mean().backward();
    let gw = weight.grad().expect("conv weight receives a gradient");
    assert_eq!(gw.shape(), &[3, 1, 3, 3]);
    assert!(gw.data().iter().all(|g| g.is_finite()));
    // conv weight, conv bias, bn gamma/beta, linear weight/bias
    assert_eq!(model.parameters().len(), 6);
}

#[test]
fn test_numerical_stability() {
    Tape::reset();
    let x = Tensor::new(vec![1e6, -1e6, 1e-6, -1e-6], &[2, 2]).requires_grad();
    let w = Tensor::new(vec![1.0, 0.5, -0.5, 1.0], &[2, 2]).requires_grad();
    let y = x.linear(&w, None);
    assert!(y.data().iter().all(|v| v.is_finite()));

    y.sum().backward();
    assert!(x.grad().unwrap().data().iter().all(|g| g.is_finite()));
    assert!(w.grad().unwrap().data().iter().all(|g| g.is_finite()));
}
