//! The step pipeline.
//!
//! Per substep: velocity integration, row preparation (which applies the
//! warm-start impulses), the iterated Gauss-Seidel velocity solve, position
//! integration, then the relaxation passes that re-iterate against the now
//! stale position bias to drain the energy it injected. Sleep state is
//! updated once per step.
//!
//! In multi-threaded mode the iterate passes run on the worker pool. Rows
//! are greedily coloured so that no two rows of one colour share a dynamic
//! body; a colour's rows run concurrently (no body has two writers), the
//! colours themselves are barriers.

use crate::body::RigidBody;
use crate::config::StepConfig;
use crate::constraints::{Constraint, SmallConstraint};
use crate::contact::ContactManifold;
use crate::errors::WorldErrors;
use crate::world::World;
use crate::BodyHandle;
use arena::Arena;
use log::trace;
use std::collections::HashMap;
use std::sync::Arc;
use worker_pool::ThreadPool;

pub(crate) fn step(world: &mut World, dt: f64, multi_thread: bool) -> Result<(), WorldErrors> {
    if !dt.is_finite() || dt <= 0.0 {
        return Err(WorldErrors::InvalidArgument("dt must be finite and > 0"));
    }
    world.step_config.validate()?;
    let config = world.step_config;

    let substeps = config.substep_count;
    let sdt = dt / substeps as f64;
    let inv_sdt = 1.0 / sdt;

    let pool = if multi_thread {
        let pool = ThreadPool::global();
        pool.set_model(config.thread_model);
        Some(pool)
    } else {
        None
    };

    wake_connected_bodies(world);

    let coloring = pool.map(|_| Coloring::build(world));
    trace!(
        "step dt={dt} substeps={substeps} bodies={} rows={}/{}/{}",
        world.bodies.active_len(),
        world.contacts.len(),
        world.constraints.len(),
        world.small_constraints.len()
    );

    for _ in 0..substeps {
        world.step_stamp += 1;
        let stamp = world.step_stamp;

        for body in world.bodies.iter_active_mut() {
            body.integrate_velocity(sdt, &config.gravity);
        }

        prepare_rows(world, inv_sdt, stamp);

        for _ in 0..config.solver_iterations {
            match (pool, &coloring) {
                (Some(pool), Some(coloring)) => iterate_parallel(world, pool, coloring, inv_sdt),
                _ => iterate_serial(world, inv_sdt),
            }
        }

        for body in world.bodies.iter_active_mut() {
            body.integrate_position(sdt);
        }

        // no re-prepare here: the relaxation passes run against the bias
        // computed before position integration
        for _ in 0..config.relax_iterations {
            match (pool, &coloring) {
                (Some(pool), Some(coloring)) => iterate_parallel(world, pool, coloring, inv_sdt),
                _ => iterate_serial(world, inv_sdt),
            }
        }
    }

    update_sleep_state(world, dt, &config);

    for manifold in world.contacts.iter_live_mut() {
        manifold.begin_step();
    }
    Ok(())
}

/// Whether a row takes part in the solve: at least one endpoint must be a
/// dynamic body that is awake.
fn row_is_active(bodies: &Arena<RigidBody>, body1: BodyHandle, body2: BodyHandle) -> bool {
    for handle in [body1, body2] {
        if let Ok(body) = bodies.get(handle) {
            if !body.is_static() && body.active {
                return true;
            }
        }
    }
    false
}

/// A sleeping body constrained to an awake dynamic one is pulled back into
/// the simulation before the solve touches the pair.
fn wake_connected_bodies(world: &mut World) {
    loop {
        let mut woke_any = false;
        let mut wake = |bodies: &mut Arena<RigidBody>, h1: BodyHandle, h2: BodyHandle| {
            if !row_is_active(bodies, h1, h2) {
                return false;
            }
            let mut woke = false;
            for handle in [h1, h2] {
                let asleep = bodies
                    .get(handle)
                    .map(|b| !b.is_static() && !b.active)
                    .unwrap_or(false);
                if asleep {
                    let body = bodies.get_mut(handle).expect("handle just resolved");
                    body.active = true;
                    body.sleep_time = 0.0;
                    bodies.set_active(handle, true).expect("handle just resolved");
                    woke = true;
                }
            }
            woke
        };

        for i in 0..world.contacts.len() {
            let row = &world.contacts.iter_live()[i];
            let (h1, h2) = (row.body1, row.body2);
            woke_any |= wake(&mut world.bodies, h1, h2);
        }
        for i in 0..world.constraints.len() {
            let row = &world.constraints.iter_live()[i];
            let (h1, h2) = (row.body1, row.body2);
            woke_any |= wake(&mut world.bodies, h1, h2);
        }
        for i in 0..world.small_constraints.len() {
            let row = &world.small_constraints.iter_live()[i];
            let (h1, h2) = (row.body1, row.body2);
            woke_any |= wake(&mut world.bodies, h1, h2);
        }

        // waking can cascade along chains of rows
        if !woke_any {
            break;
        }
    }
}

fn prepare_rows(world: &mut World, inv_dt: f64, stamp: u64) {
    let World { bodies, contacts, constraints, small_constraints, .. } = world;

    for row in contacts.iter_live_mut() {
        if !row_is_active(bodies, row.body1, row.body2) {
            continue;
        }
        let warm_start = row.stamp != stamp;
        row.stamp = stamp;
        let Ok((b1, b2)) = bodies.get_pair_mut(row.body1, row.body2) else {
            continue;
        };
        row.prepare(b1, b2, inv_dt, warm_start);
    }
    for row in constraints.iter_live_mut() {
        if !row_is_active(bodies, row.body1, row.body2) {
            continue;
        }
        let Ok((b1, b2)) = bodies.get_pair_mut(row.body1, row.body2) else {
            continue;
        };
        row.prepare(b1, b2, inv_dt, stamp);
    }
    for row in small_constraints.iter_live_mut() {
        if !row_is_active(bodies, row.body1, row.body2) {
            continue;
        }
        let Ok((b1, b2)) = bodies.get_pair_mut(row.body1, row.body2) else {
            continue;
        };
        row.prepare(b1, b2, inv_dt, stamp);
    }
}

fn iterate_serial(world: &mut World, inv_dt: f64) {
    let World { bodies, contacts, constraints, small_constraints, .. } = world;

    for row in contacts.iter_live_mut() {
        if !row_is_active(bodies, row.body1, row.body2) {
            continue;
        }
        let Ok((b1, b2)) = bodies.get_pair_mut(row.body1, row.body2) else {
            continue;
        };
        row.iterate(b1, b2, inv_dt);
    }
    for row in constraints.iter_live_mut() {
        if !row_is_active(bodies, row.body1, row.body2) {
            continue;
        }
        let Ok((b1, b2)) = bodies.get_pair_mut(row.body1, row.body2) else {
            continue;
        };
        row.iterate(b1, b2, inv_dt);
    }
    for row in small_constraints.iter_live_mut() {
        if !row_is_active(bodies, row.body1, row.body2) {
            continue;
        }
        let Ok((b1, b2)) = bodies.get_pair_mut(row.body1, row.body2) else {
            continue;
        };
        row.iterate(b1, b2, inv_dt);
    }
}

/// A partition of each arena's rows into colours such that no two rows of
/// one colour share a dynamic body. Rebuilt every multi-threaded step; the
/// row sets cannot change mid-step.
struct Coloring {
    contacts: Vec<Arc<Vec<u32>>>,
    constraints: Vec<Arc<Vec<u32>>>,
    small_constraints: Vec<Arc<Vec<u32>>>,
}

impl Coloring {
    fn build(world: &World) -> Self {
        Self {
            contacts: color_rows(
                &world.bodies,
                world.contacts.len(),
                |i| {
                    let row = &world.contacts.iter_live()[i];
                    (row.body1, row.body2)
                },
            ),
            constraints: color_rows(
                &world.bodies,
                world.constraints.len(),
                |i| {
                    let row = &world.constraints.iter_live()[i];
                    (row.body1, row.body2)
                },
            ),
            small_constraints: color_rows(
                &world.bodies,
                world.small_constraints.len(),
                |i| {
                    let row = &world.small_constraints.iter_live()[i];
                    (row.body1, row.body2)
                },
            ),
        }
    }
}

fn color_rows(
    bodies: &Arena<RigidBody>,
    row_count: usize,
    endpoints: impl Fn(usize) -> (BodyHandle, BodyHandle),
) -> Vec<Arc<Vec<u32>>> {
    // colours used per dynamic body, keyed by slot index
    let mut used: HashMap<u32, Vec<bool>> = HashMap::new();
    let mut colors: Vec<Vec<u32>> = Vec::new();

    for i in 0..row_count {
        let (h1, h2) = endpoints(i);
        let dynamic: Vec<u32> = [h1, h2]
            .into_iter()
            .filter(|&h| bodies.get(h).map(|b| !b.is_static()).unwrap_or(false))
            .map(|h| h.index())
            .collect();

        let mut color = 0;
        loop {
            let conflict = dynamic.iter().any(|slot| {
                used.get(slot)
                    .and_then(|flags| flags.get(color))
                    .copied()
                    .unwrap_or(false)
            });
            if !conflict {
                break;
            }
            color += 1;
        }

        for slot in &dynamic {
            let flags = used.entry(*slot).or_default();
            if flags.len() <= color {
                flags.resize(color + 1, false);
            }
            flags[color] = true;
        }
        if colors.len() <= color {
            colors.resize_with(color + 1, Vec::new);
        }
        colors[color].push(i as u32);
    }

    colors.into_iter().map(Arc::new).collect()
}

/// Raw access shuttled into pool tasks. The colour partition guarantees at
/// most one task writes any body or row, which is what makes the aliased
/// mutation sound in practice.
struct SolverAccess {
    bodies: *mut Arena<RigidBody>,
    contacts: *mut Arena<ContactManifold>,
    constraints: *mut Arena<Constraint>,
    small_constraints: *mut Arena<SmallConstraint>,
}

unsafe impl Send for SolverAccess {}
unsafe impl Sync for SolverAccess {}

impl Clone for SolverAccess {
    fn clone(&self) -> Self {
        Self {
            bodies: self.bodies,
            contacts: self.contacts,
            constraints: self.constraints,
            small_constraints: self.small_constraints,
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum RowArena {
    Contacts,
    Constraints,
    SmallConstraints,
}

fn iterate_parallel(world: &mut World, pool: &ThreadPool, coloring: &Coloring, inv_dt: f64) {
    let access = SolverAccess {
        bodies: &mut world.bodies,
        contacts: &mut world.contacts,
        constraints: &mut world.constraints,
        small_constraints: &mut world.small_constraints,
    };
    let chunk_target = pool.thread_count();

    let groups = [
        (RowArena::Contacts, &coloring.contacts),
        (RowArena::Constraints, &coloring.constraints),
        (RowArena::SmallConstraints, &coloring.small_constraints),
    ];

    for (arena_kind, colors) in groups {
        for color in colors.iter() {
            if color.is_empty() {
                continue;
            }
            let chunk_len = color.len().div_ceil(chunk_target);
            for start in (0..color.len()).step_by(chunk_len) {
                let end = (start + chunk_len).min(color.len());
                let indices = Arc::clone(color);
                let task_access = access.clone();
                pool.add_task(move || {
                    run_chunk(&task_access, arena_kind, &indices[start..end], inv_dt);
                });
            }
            // a colour is a barrier: its rows touch disjoint bodies, the
            // next colour may not start until they are done
            pool.execute();
        }
    }
}

fn run_chunk(access: &SolverAccess, arena_kind: RowArena, indices: &[u32], inv_dt: f64) {
    // each row index is owned by exactly one chunk per pass, and rows of
    // one colour share no dynamic body
    let bodies = unsafe { &mut *access.bodies };
    match arena_kind {
        RowArena::Contacts => {
            let rows = unsafe { &mut *access.contacts };
            for &i in indices {
                let row = &mut rows.iter_live_mut()[i as usize];
                if !row_is_active(bodies, row.body1, row.body2) {
                    continue;
                }
                let Ok((b1, b2)) = bodies.get_pair_mut(row.body1, row.body2) else {
                    continue;
                };
                row.iterate(b1, b2, inv_dt);
            }
        }
        RowArena::Constraints => {
            let rows = unsafe { &mut *access.constraints };
            for &i in indices {
                let row = &mut rows.iter_live_mut()[i as usize];
                if !row_is_active(bodies, row.body1, row.body2) {
                    continue;
                }
                let Ok((b1, b2)) = bodies.get_pair_mut(row.body1, row.body2) else {
                    continue;
                };
                row.iterate(b1, b2, inv_dt);
            }
        }
        RowArena::SmallConstraints => {
            let rows = unsafe { &mut *access.small_constraints };
            for &i in indices {
                let row = &mut rows.iter_live_mut()[i as usize];
                if !row_is_active(bodies, row.body1, row.body2) {
                    continue;
                }
                let Ok((b1, b2)) = bodies.get_pair_mut(row.body1, row.body2) else {
                    continue;
                };
                row.iterate(b1, b2, inv_dt);
            }
        }
    }
}

/// Bodies slower than the threshold for long enough fall asleep, but only
/// one whole island at a time: a body constrained to a still-moving
/// neighbour stays awake.
fn update_sleep_state(world: &mut World, dt: f64, config: &StepConfig) {
    if config.sleep_threshold <= 0.0 {
        return;
    }

    let mut islands = IslandForest::new();
    for i in 0..world.contacts.len() {
        let row = &world.contacts.iter_live()[i];
        islands.union_dynamic(&world.bodies, row.body1, row.body2);
    }
    for i in 0..world.constraints.len() {
        let row = &world.constraints.iter_live()[i];
        islands.union_dynamic(&world.bodies, row.body1, row.body2);
    }
    for i in 0..world.small_constraints.len() {
        let row = &world.small_constraints.iter_live()[i];
        islands.union_dynamic(&world.bodies, row.body1, row.body2);
    }

    // first pass: accumulate sleep timers and each island's readiness
    let mut island_ready: HashMap<u32, bool> = HashMap::new();
    for i in 0..world.bodies.active_len() {
        let handle = world.bodies.handle_at(i);
        let body = &mut world.bodies.iter_active_mut()[i];
        if body.is_static() {
            continue;
        }
        let motion = body.velocity.norm() + body.angular_velocity.norm();
        if motion < config.sleep_threshold {
            body.sleep_time += dt;
        } else {
            body.sleep_time = 0.0;
        }
        let root = islands.find(handle.index());
        body.island_id = root;
        let ready = body.sleep_time >= config.sleep_time;
        island_ready
            .entry(root)
            .and_modify(|r| *r &= ready)
            .or_insert(ready);
    }

    // second pass: deactivate the islands that are ready end to end
    let mut to_sleep: Vec<BodyHandle> = Vec::new();
    for i in 0..world.bodies.active_len() {
        let handle = world.bodies.handle_at(i);
        let body = &world.bodies.iter_active()[i];
        if body.is_static() {
            continue;
        }
        if island_ready.get(&body.island_id).copied().unwrap_or(false) {
            to_sleep.push(handle);
        }
    }
    for handle in to_sleep {
        let body = world.bodies.get_mut(handle).expect("handle taken from live range");
        body.active = false;
        body.velocity = nalgebra::Vector3::zeros();
        body.angular_velocity = nalgebra::Vector3::zeros();
        world.bodies.set_active(handle, false).expect("handle taken from live range");
    }
}

/// Union-find over body slots, used to group constrained bodies into
/// islands for the sleep decision.
struct IslandForest {
    parent: HashMap<u32, u32>,
}

impl IslandForest {
    fn new() -> Self {
        Self { parent: HashMap::new() }
    }

    fn find(&mut self, slot: u32) -> u32 {
        let parent = *self.parent.entry(slot).or_insert(slot);
        if parent == slot {
            return slot;
        }
        let root = self.find(parent);
        self.parent.insert(slot, root);
        root
    }

    fn union_dynamic(&mut self, bodies: &Arena<RigidBody>, h1: BodyHandle, h2: BodyHandle) {
        let dynamic = |h: BodyHandle| bodies.get(h).map(|b| !b.is_static()).unwrap_or(false);
        if !dynamic(h1) || !dynamic(h2) {
            // a static body does not tie islands together
            return;
        }
        let r1 = self.find(h1.index());
        let r2 = self.find(h2.index());
        if r1 != r2 {
            self.parent.insert(r2, r1);
        }
    }
}
