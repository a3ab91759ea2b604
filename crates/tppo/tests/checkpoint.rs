use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tch::Device;
use tppo::checkpoint::{OPTIMIZERS_FILE, PARAM_GROUPS_FILE};
use tppo::config::TrainerConfig;
use tppo::mas::toy::{ToyMasConfig, ToyTokenMas};
use tppo::mas::AgentRole;
use tppo::optim::AdamState;
use tppo::trainer::TppoTrainer;
use tppo::TppoError;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "tppo_it_{}_{}_{}",
        name,
        std::process::id(),
        rand::random::<u32>()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn toy_mas(roles: &[&str]) -> ToyTokenMas {
    tch::manual_seed(11);
    ToyTokenMas::new(ToyMasConfig {
        roles: roles.iter().map(|r| r.to_string()).collect(),
        dropout: 0.0,
        ..Default::default()
    })
    .unwrap()
}

fn config() -> TrainerConfig {
    TrainerConfig::default().with_lr(1e-3).with_kl_threshold(1e-3)
}

/// Trainer that has applied one critic and one policy step
fn trained(roles: &[&str]) -> TppoTrainer<ToyTokenMas> {
    let mas = toy_mas(roles);
    let mut rng = StdRng::seed_from_u64(5);
    let sample = mas.synthetic_rollout(6, 4, &mut rng).unwrap();
    let mut trainer = TppoTrainer::new(mas, config()).unwrap();
    let stats = trainer.ppo_update(&sample, 0).unwrap();
    assert!(stats.policy_grad_norm > 0.0);
    trainer
}

fn assert_same_state(a: &AdamState, b: &AdamState) {
    assert_eq!(a.params.len(), b.params.len());
    for (x, y) in a.params.iter().zip(&b.params) {
        match (x, y) {
            (None, None) => {}
            (Some(x), Some(y)) => {
                assert_eq!(x.step, y.step);
                assert!(x.exp_avg.equal(&y.exp_avg));
                assert!(x.exp_avg_sq.equal(&y.exp_avg_sq));
            }
            _ => panic!("parameter state initialized on one side only"),
        }
    }
}

#[test]
fn test_save_and_load_round_trip() {
    let dir = temp_dir("round_trip");
    let source = trained(&["planner", "solver"]);

    let path = source.save_optimizers(&dir, 3).unwrap();
    assert_eq!(path, dir.join("steps_0003").join(OPTIMIZERS_FILE));
    assert!(path.exists());
    assert!(dir.join("steps_0003").join(PARAM_GROUPS_FILE).exists());

    let mut target = TppoTrainer::new(toy_mas(&["planner", "solver"]), config()).unwrap();
    target.load_optimizers(&path, Device::Cpu).unwrap();

    for role in ["planner", "solver"] {
        let role = AgentRole::new(role).unwrap();
        let a = source.registry().policy(&role).unwrap().state();
        let b = target.registry().policy(&role).unwrap().state();
        assert_eq!(b.max_step(), 1);
        assert_same_state(&a, &b);
    }
    assert_same_state(
        &source.registry().critic().state(),
        &target.registry().critic().state(),
    );

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_load_path_restores_on_construction() {
    let dir = temp_dir("load_path");
    let source = trained(&["planner"]);
    source.save_optimizers(&dir, 12).unwrap();

    let config = config().with_load_path(dir.join("steps_0012"));
    let target = TppoTrainer::new(toy_mas(&["planner"]), config).unwrap();
    assert_eq!(target.registry().critic().state().max_step(), 1);
    assert_same_state(
        &source.registry().critic().state(),
        &target.registry().critic().state(),
    );

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_load_rejects_unregistered_role() {
    let dir = temp_dir("unknown_role");
    let source = trained(&["planner", "solver"]);
    let path = source.save_optimizers(&dir, 1).unwrap();

    let mut target = TppoTrainer::new(toy_mas(&["planner"]), config()).unwrap();
    let result = target.load_optimizers(&path, Device::Cpu);
    assert!(matches!(result, Err(TppoError::UnknownRole(role)) if role == "solver"));
    // nothing was restored
    assert_eq!(target.registry().critic().state().max_step(), 0);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_load_rejects_mismatched_parameters() {
    let dir = temp_dir("mismatch");
    let source = trained(&["planner"]);
    let path = source.save_optimizers(&dir, 1).unwrap();

    tch::manual_seed(11);
    let wider = ToyTokenMas::new(ToyMasConfig {
        roles: vec!["planner".into()],
        hidden_size: 24,
        dropout: 0.0,
        ..Default::default()
    })
    .unwrap();
    let mut target = TppoTrainer::new(wider, config()).unwrap();
    assert!(matches!(
        target.load_optimizers(&path, Device::Cpu),
        Err(TppoError::Checkpoint(_))
    ));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_failed_load_leaves_optimizers_untouched() {
    let dir = temp_dir("partial");
    let source = trained(&["planner", "solver"]);
    let path = source.save_optimizers(&dir, 1).unwrap();

    // same roles, but the critic now embeds three agents
    let mut target =
        TppoTrainer::new(toy_mas(&["planner", "solver", "planner"]), config()).unwrap();
    assert!(matches!(
        target.load_optimizers(&path, Device::Cpu),
        Err(TppoError::Checkpoint(_))
    ));
    for role in ["planner", "solver"] {
        let opt = target.registry().policy(&AgentRole::new(role).unwrap()).unwrap();
        assert_eq!(opt.state().max_step(), 0);
        assert_eq!(opt.state().num_initialized(), 0);
    }
    assert_eq!(target.registry().critic().state().max_step(), 0);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_missing_checkpoint_is_an_error() {
    let dir = temp_dir("missing");
    let mut target = TppoTrainer::new(toy_mas(&["planner"]), config()).unwrap();
    assert!(target
        .load_optimizers(dir.join(OPTIMIZERS_FILE), Device::Cpu)
        .is_err());
    std::fs::remove_dir_all(&dir).ok();
}
