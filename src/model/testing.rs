//! Tiny randomly initialized checkpoints for unit tests

use super::{Activation, ModelConfig, WeightStore, POSITION_OFFSET};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub(crate) fn tiny_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 11,
        hidden_size: 8,
        num_hidden_layers: 2,
        num_attention_heads: 2,
        ffn_dim: 16,
        max_position_embeddings: 16,
        activation_function: Activation::Relu,
        do_layer_norm_before: true,
        word_embed_proj_dim: None,
        dropout: 0.1,
        enable_bias: true,
        layer_norm_eps: 1e-5,
        eos_token_id: Some(2),
    }
}

/// Every tensor an OPT checkpoint of `config` holds, filled from `seed`
pub(crate) fn tiny_store(config: &ModelConfig, seed: u64) -> WeightStore {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut store = WeightStore::new();
    let mut put = |name: String, shape: Vec<usize>, rng: &mut StdRng| {
        let numel: usize = shape.iter().product();
        let values: Vec<f32> = (0..numel).map(|_| rng.gen_range(-0.3..0.3)).collect();
        store.insert(&name, shape, values).unwrap();
    };

    let (h, f) = (config.hidden_size, config.ffn_dim);
    put("model.decoder.embed_tokens.weight".into(), vec![config.vocab_size, h], &mut rng);
    put(
        "model.decoder.embed_positions.weight".into(),
        vec![config.max_position_embeddings + POSITION_OFFSET, h],
        &mut rng,
    );
    for i in 0..config.num_hidden_layers {
        let p = format!("model.decoder.layers.{i}");
        for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
            put(format!("{p}.self_attn.{proj}.weight"), vec![h, h], &mut rng);
            put(format!("{p}.self_attn.{proj}.bias"), vec![h], &mut rng);
        }
        put(format!("{p}.fc1.weight"), vec![f, h], &mut rng);
        put(format!("{p}.fc1.bias"), vec![f], &mut rng);
        put(format!("{p}.fc2.weight"), vec![h, f], &mut rng);
        put(format!("{p}.fc2.bias"), vec![h], &mut rng);
        for norm in ["self_attn_layer_norm", "final_layer_norm"] {
            put(format!("{p}.{norm}.weight"), vec![h], &mut rng);
            put(format!("{p}.{norm}.bias"), vec![h], &mut rng);
        }
    }
    put("model.decoder.final_layer_norm.weight".into(), vec![h], &mut rng);
    put("model.decoder.final_layer_norm.bias".into(), vec![h], &mut rng);
    store
}
