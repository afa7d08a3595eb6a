use std::cell::RefCell;
use std::rc::Rc;

use crate::tensor::Tensor;

thread_local! {
    static TAPE: RefCell<TapeInner> = RefCell::new(TapeInner { nodes: Vec::new() });
}

/// Handle to the thread-local autograd tape.
///
/// Every differentiable op pushes one backward closure; `Tensor::backward`
/// replays them in reverse up to the node that produced the loss.
pub struct Tape;

struct TapeInner {
    // Closures are Rc so they can be cloned out of the borrow before running.
    nodes: Vec<Node>,
}

struct Node {
    backward_fn: Rc<dyn Fn()>,
}

impl Tape {
    /// Clear recorded nodes. Call once per batch before the forward pass.
    pub fn reset() {
        TAPE.with(|t| t.borrow_mut().nodes.clear());
    }

    /// Number of nodes currently recorded on this thread.
    pub fn len() -> usize {
        TAPE.with(|t| t.borrow().nodes.len())
    }

    pub fn is_empty() -> bool {
        Self::len() == 0
    }

    pub fn push_binary_op<F>(a: &Tensor, b: &Tensor, output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        if !(a.requires_grad || b.requires_grad) {
            return;
        }
        Self::record(output, backward_fn);
    }

    pub fn push_unary_op<F>(input: &Tensor, output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        if !input.requires_grad {
            return;
        }
        Self::record(output, backward_fn);
    }

    /// Record a node for an op with an arbitrary number of inputs.
    pub fn push_op<F>(inputs: &[&Tensor], output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        if !inputs.iter().any(|t| t.requires_grad) {
            return;
        }
        Self::record(output, backward_fn);
    }

    fn record<F>(output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        let id = TAPE.with(|t| {
            let mut inner = t.borrow_mut();
            let id = inner.nodes.len();
            inner.nodes.push(Node {
                backward_fn: Rc::new(backward_fn),
            });
            id
        });
        // stamp after releasing the tape borrow
        output.tape_node.set(Some(id));
    }
}

/// Execute backward functions up to `final_node_id` (inclusive), in reverse.
pub fn backward(final_node_id: usize) {
    let fns: Vec<Rc<dyn Fn()>> = TAPE.with(|t| {
        let inner = t.borrow();
        if inner.nodes.is_empty() {
            return Vec::new();
        }
        let end = final_node_id.min(inner.nodes.len() - 1);
        inner.nodes[..=end]
            .iter()
            .map(|n| n.backward_fn.clone())
            .collect()
    });

    // No tape borrow is alive while closures run.
    for f in fns.into_iter().rev() {
        (f)();
    }
}
