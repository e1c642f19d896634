//! Property tests for deferred command queues.
//!
//! These tests use `proptest` to generate random command sequences, apply
//! them to a scene, and check the outcome against a simple model of FIFO
//! application.

use proptest::prelude::*;
use strata_ecs::prelude::*;

#[derive(Debug, Default, Clone, PartialEq)]
struct Hp(u32);

#[derive(Debug, Default, Clone, PartialEq)]
struct Score(i64);

#[derive(Debug, Clone)]
enum CmdOp {
    AddHp(usize, u32),
    AddScore(usize, i64),
    RemoveHp(usize),
    Delete(usize),
}

fn cmd_op_strategy() -> impl Strategy<Value = CmdOp> {
    prop_oneof![
        (0..20usize, any::<u32>()).prop_map(|(i, v)| CmdOp::AddHp(i, v)),
        (0..20usize, any::<i64>()).prop_map(|(i, v)| CmdOp::AddScore(i, v)),
        (0..20usize).prop_map(CmdOp::RemoveHp),
        (0..20usize).prop_map(CmdOp::Delete),
    ]
}

/// Record `ops` against `entities` into `queue`.
fn record(queue: &CommandQueue, ops: &[CmdOp], entities: &[Entity]) {
    let cmds = queue.commands();
    for op in ops {
        match *op {
            CmdOp::AddHp(idx, val) => cmds.add(entities[idx % entities.len()], Hp(val)),
            CmdOp::AddScore(idx, val) => cmds.add(entities[idx % entities.len()], Score(val)),
            CmdOp::RemoveHp(idx) => cmds.remove::<Hp>(entities[idx % entities.len()]),
            CmdOp::Delete(idx) => cmds.delete(entities[idx % entities.len()]),
        }
    }
}

/// A fresh scene with Hp and Score registered, plus 5 entities holding Hp.
fn setup_scene_and_entities() -> (Scene, Vec<Entity>) {
    let mut scene = Scene::new();
    scene.register_component::<Hp>("hp");
    scene.register_component::<Score>("score");

    let mut entities = Vec::new();
    for i in 0..5u32 {
        let e = scene.create_entity();
        *scene.add_component::<Hp>(e).unwrap() = Hp(100 + i);
        entities.push(e);
    }
    scene.flush();
    (scene, entities)
}

#[derive(Debug, Clone, Copy)]
struct Model {
    alive: bool,
    hp: bool,
    score: bool,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(5_000))]

    /// Every command either applies or fails exactly as FIFO application
    /// against the model predicts.
    #[test]
    fn queue_outcome_matches_fifo_model(ops in prop::collection::vec(cmd_op_strategy(), 1..30)) {
        let (mut scene, entities) = setup_scene_and_entities();
        let mut model = vec![Model { alive: true, hp: true, score: false }; entities.len()];

        let mut expected_ok = 0;
        for op in &ops {
            let ok = match *op {
                CmdOp::AddHp(idx, _) => {
                    let m = &mut model[idx % entities.len()];
                    let ok = m.alive && !m.hp;
                    m.hp |= ok;
                    ok
                }
                CmdOp::AddScore(idx, _) => {
                    let m = &mut model[idx % entities.len()];
                    let ok = m.alive && !m.score;
                    m.score |= ok;
                    ok
                }
                CmdOp::RemoveHp(idx) => {
                    let m = &mut model[idx % entities.len()];
                    let ok = m.alive && m.hp;
                    m.hp &= !ok;
                    ok
                }
                CmdOp::Delete(idx) => {
                    let m = &mut model[idx % entities.len()];
                    let ok = m.alive;
                    m.alive = false;
                    ok
                }
            };
            expected_ok += usize::from(ok);
        }

        let queue = CommandQueue::new();
        record(&queue, &ops, &entities);
        prop_assert_eq!(queue.len(), ops.len());

        let report = queue.apply(&mut scene);
        prop_assert_eq!(report.success_count, expected_ok);
        prop_assert_eq!(report.success_count + report.failed_count, ops.len());

        scene.flush();
        for (e, m) in entities.iter().zip(&model) {
            prop_assert_eq!(scene.is_alive(*e), m.alive);
            if m.alive {
                prop_assert_eq!(scene.has_component::<Hp>(*e).unwrap(), m.hp);
                prop_assert_eq!(scene.has_component::<Score>(*e).unwrap(), m.score);
            }
        }
    }

    /// The same command sequence applied to two identical scenes produces
    /// identical reports.
    #[test]
    fn queue_application_is_deterministic(ops in prop::collection::vec(cmd_op_strategy(), 1..20)) {
        fn run_once(ops: &[CmdOp]) -> ApplyReport {
            let (mut scene, entities) = setup_scene_and_entities();
            let queue = CommandQueue::new();
            record(&queue, ops, &entities);
            queue.apply(&mut scene)
        }

        prop_assert_eq!(run_once(&ops), run_once(&ops));
    }

    /// Commands recorded after a delete of the same entity fail without
    /// touching other entities.
    #[test]
    fn delete_then_modify_is_graceful(hp_val in any::<u32>(), score_val in any::<i64>()) {
        let (mut scene, entities) = setup_scene_and_entities();
        let target = entities[0];

        let queue = CommandQueue::new();
        let cmds = queue.commands();
        cmds.delete(target);
        cmds.add(target, Hp(hp_val));
        cmds.add(target, Score(score_val));
        cmds.add(entities[1], Score(score_val));

        let report = queue.apply(&mut scene);
        prop_assert_eq!(report, ApplyReport { success_count: 2, failed_count: 2 });
        prop_assert!(!scene.is_alive(target));

        scene.flush();
        prop_assert_eq!(scene.get_component::<Score>(entities[1]).unwrap(), &Score(score_val));
    }
}
