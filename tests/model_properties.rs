use approx::assert_abs_diff_eq;
use verdict::{Config, GptModel, ModelError};

fn model(seed: u64) -> GptModel {
    let config = Config {
        vocab_size: 20,
        context_length: 12,
        n_embd: 16,
        n_heads: 4,
        n_layers: 2,
        dropout_rate: 0.1,
        qkv_bias: true,
    };
    GptModel::new(&config, seed).unwrap()
}

#[test]
fn logits_have_batch_seq_vocab_shape() {
    let logits = model(0).forward(&[vec![1, 2, 3, 4], vec![5, 6, 7, 8]]).unwrap();
    assert_eq!(logits.shape, vec![2, 4, 20]);
    assert!(logits.data.iter().all(|x| x.is_finite()));
}

#[test]
fn construction_checks_head_divisibility() {
    let config = Config {
        n_embd: 18,
        n_heads: 4,
        ..Config::tiny(20)
    };
    assert!(matches!(GptModel::new(&config, 0), Err(ModelError::InvalidConfig(_))));
}

#[test]
fn later_tokens_do_not_change_earlier_logits() {
    let model = model(1);
    let a = model.forward(&[vec![1, 2, 3, 4, 5, 6]]).unwrap();
    let b = model.forward(&[vec![1, 2, 3, 19, 0, 7]]).unwrap();
    let vocab = 20;

    for i in 0..3 * vocab {
        assert_abs_diff_eq!(a.data[i], b.data[i], epsilon = 1e-6);
    }
    let differs = (3 * vocab..6 * vocab).any(|i| (a.data[i] - b.data[i]).abs() > 1e-6);
    assert!(differs);
}

#[test]
fn forward_is_deterministic() {
    let ids = [vec![4, 8, 15, 16, 2, 3]];
    let first = model(2).forward(&ids).unwrap();
    let second = model(2).forward(&ids).unwrap();
    assert_eq!(first, second);

    let reused = model(2);
    assert_eq!(reused.forward(&ids).unwrap(), reused.forward(&ids).unwrap());
}

#[test]
fn attention_rows_are_causal_distributions() {
    let model = model(3);
    let seq = 5;
    for layer in 0..2 {
        let weights = model.attention_weights(&[vec![3, 1, 4, 1, 5]], layer).unwrap();
        assert_eq!(weights.shape, vec![1, 4, seq, seq]);

        for (index, values) in weights.data.chunks(seq).enumerate() {
            let i = index % seq;
            assert_abs_diff_eq!(values.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
            assert!(values.iter().all(|&w| w >= 0.0));
            assert!(values[i + 1..].iter().all(|&w| w == 0.0));
        }
    }
}

#[test]
fn attention_layer_out_of_range() {
    assert!(model(0).attention_weights(&[vec![1]], 2).is_err());
}

#[test]
fn batch_entries_are_independent() {
    let model = model(4);
    let alone = model.forward(&[vec![9, 8, 7]]).unwrap();
    let batched = model.forward(&[vec![9, 8, 7], vec![1, 1, 1]]).unwrap();
    for (x, y) in alone.data.iter().zip(&batched.data[..alone.numel()]) {
        assert_abs_diff_eq!(x, y, epsilon = 1e-6);
    }
}

#[test]
fn input_validation() {
    let model = model(0);
    assert!(matches!(
        model.forward(&[vec![20]]),
        Err(ModelError::TokenOutOfRange { id: 20, vocab_size: 20 })
    ));
    assert!(matches!(
        model.forward(&[vec![0; 13]]),
        Err(ModelError::SequenceTooLong { len: 13, max: 12 })
    ));
}

#[test]
fn load_state_dict_rejects_mismatch_and_keeps_weights() {
    let mut target = model(5);
    let before = target.state_dict();

    let mut state = model(6).state_dict();
    state.insert(
        "blocks.1.mlp.c_fc.weight".to_string(),
        verdict::Tensor::zeros(vec![16, 32]),
    );

    match target.load_state_dict(&state) {
        Err(ModelError::ShapeMismatch { name, expected, actual }) => {
            assert_eq!(name, "blocks.1.mlp.c_fc.weight");
            assert_eq!(expected, vec![16, 64]);
            assert_eq!(actual, vec![16, 32]);
        }
        other => panic!("expected shape mismatch, got {other:?}"),
    }
    assert_eq!(target.state_dict(), before);
}

#[test]
fn gpt2_124m_parameter_count_from_shapes() {
    // Count from the named shapes without allocating the full model
    let c = Config::gpt2_124m();
    let (v, t, e, l) = (c.vocab_size, c.context_length, c.n_embd, c.n_layers);
    let per_block = 2 * 2 * e + 3 * e * e + e * e + e + e * 4 * e + 4 * e + 4 * e * e + e;
    let untied = v * e + t * e + l * per_block + 2 * e + e * v;

    let small = GptModel::new(&Config::tiny(50), 0).unwrap();
    let sc = small.config();
    let small_block =
        2 * 2 * sc.n_embd + 4 * sc.n_embd * sc.n_embd + sc.n_embd + 8 * sc.n_embd * sc.n_embd + 5 * sc.n_embd;
    let expected_small = 50 * sc.n_embd + sc.context_length * sc.n_embd + sc.n_layers * small_block
        + 2 * sc.n_embd
        + sc.n_embd * 50;
    assert_eq!(small.count_parameters(), expected_small);
    assert_eq!(small.count_parameters_tied(), expected_small - sc.n_embd * 50);

    // 50257 x 768 head on top of ~124M tied weights
    assert!(untied - e * v > 120_000_000 && untied - e * v < 125_000_000);
}
