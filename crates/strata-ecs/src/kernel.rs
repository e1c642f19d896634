//! Kernels and the dispatcher that runs them.
//!
//! A [`Kernel`] is a batch function invoked once per matching entity row. Its
//! [`Kernel::Params`] is a tuple of parameter markers that declares what each
//! row receives:
//!
//! | marker          | row item        | effect on matching                         |
//! |-----------------|-----------------|--------------------------------------------|
//! | [`Entity`]      | `Entity`        | none                                       |
//! | [`Read<T>`]     | `&T`            | requires `T`                               |
//! | [`Write<T>`]    | `&mut T`        | requires `T`, marks rows changed           |
//! | [`Changed<T>`]  | `&T`            | requires `T`, visits only rows whose `T` changed |
//! | [`Out<T>`]      | `&mut T`        | creates `T` where absent, marks rows changed |
//! | [`Banned<T>`]   | `&mut T`        | only archetypes lacking `T`; creates it there |
//! | [`Without<T>`]  | `()`            | only archetypes lacking `T`                |
//! | [`Global<T>`]   | `&T`            | reads the scene global `T`                 |
//! | [`GlobalMut<T>`]| `&mut T`        | writes the scene global `T`                |
//! | [`Deferred`]    | [`Commands`]    | records structural changes for after the run |
//!
//! The parameter list is turned into a [`KernelDescriptor`] once per
//! `(kernel type, name)` pair and cached by the scene. Malformed lists (a
//! component borrowed mutably twice, a type both required and excluded, an
//! entity handle borrowed as a component) fail when the descriptor is built.
//!
//! # Example
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Position(f32);
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Velocity(f32);
//!
//! struct Integrate;
//!
//! impl Kernel for Integrate {
//!     type Params = (Write<Position>, Read<Velocity>);
//!     const NAME: &'static str = "integrate";
//!
//!     fn run(&mut self, (pos, vel): Row<'_, Self::Params>) {
//!         pos.0 += vel.0;
//!     }
//! }
//!
//! let mut scene = Scene::new();
//! scene.register_component::<Position>("position");
//! scene.register_component::<Velocity>("velocity");
//!
//! let e = scene.create_entity();
//! scene.add_component::<Position>(e).unwrap();
//! *scene.add_component::<Velocity>(e).unwrap() = Velocity(2.0);
//!
//! let report = scene.run_kernel(&mut Integrate).unwrap();
//! assert_eq!(report.rows_invoked, 1);
//! assert_eq!(scene.get_component::<Position>(e).unwrap(), &Position(2.0));
//! ```

use std::any::TypeId;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::archetype::{Archetype, ArchetypeId, LentColumns};
use crate::column::{downcast_slice, downcast_slice_mut, ColumnStorage};
use crate::command::{CommandQueue, Commands};
use crate::component::{Component, ComponentRegistry, ComponentTypeId};
use crate::entity::Entity;
use crate::globals::LentGlobals;
use crate::observer::ComponentObserver;
use crate::scene::Scene;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// A batch function executed once per matching row.
pub trait Kernel: 'static {
    /// The parameter markers, usually a tuple.
    type Params: KernelParam;

    /// Name used in diagnostics and as part of the descriptor cache key.
    const NAME: &'static str;

    /// Process one row.
    fn run(&mut self, row: Row<'_, Self::Params>);
}

/// The per-row item produced by a parameter list.
pub type Row<'s, P> = <P as KernelParam>::Item<'s>;

// ---------------------------------------------------------------------------
// KernelParam
// ---------------------------------------------------------------------------

/// One kernel parameter (or a tuple of them).
///
/// `describe` contributes to the query descriptor, `prepare` borrows what the
/// parameter needs from one archetype, and `fetch` produces the item for a
/// single row from that borrow.
pub trait KernelParam {
    /// Borrowed per-archetype state.
    type State<'a>;
    /// What the kernel receives per row.
    type Item<'s>;

    fn describe(builder: &mut DescriptorBuilder<'_>) -> Result<(), EcsError>;

    fn prepare<'a>(ctx: &RowContext<'a>) -> Result<Self::State<'a>, EcsError>;

    fn fetch<'s>(state: &'s mut Self::State<'_>, row: usize, entity: Entity) -> Self::Item<'s>;
}

/// Shared read of component `T`.
pub struct Read<T>(PhantomData<fn() -> T>);

/// Exclusive write of component `T`.
pub struct Write<T>(PhantomData<fn() -> T>);

/// Shared read of `T`, visiting only rows whose `T` changed since the last
/// run that filtered on it.
pub struct Changed<T>(PhantomData<fn() -> T>);

/// Exclusive write of `T`, creating the column on archetypes that lack it.
pub struct Out<T>(PhantomData<fn() -> T>);

/// Restricts the kernel to archetypes lacking `T`, then creates `T` there.
pub struct Banned<T>(PhantomData<fn() -> T>);

/// Restricts the kernel to archetypes lacking `T`.
pub struct Without<T>(PhantomData<fn() -> T>);

/// Shared read of the scene global `T`.
pub struct Global<T>(PhantomData<fn() -> T>);

/// Exclusive write of the scene global `T`.
pub struct GlobalMut<T>(PhantomData<fn() -> T>);

/// Records structural mutations to apply after the run.
pub struct Deferred;

impl KernelParam for Entity {
    type State<'a> = ();
    type Item<'s> = Entity;

    fn describe(_: &mut DescriptorBuilder<'_>) -> Result<(), EcsError> {
        Ok(())
    }

    fn prepare<'a>(_: &RowContext<'a>) -> Result<(), EcsError> {
        Ok(())
    }

    fn fetch<'s>(_: &'s mut (), _: usize, entity: Entity) -> Entity {
        entity
    }
}

impl<T: Component> KernelParam for Read<T> {
    type State<'a> = Ref<'a, [T]>;
    type Item<'s> = &'s T;

    fn describe(builder: &mut DescriptorBuilder<'_>) -> Result<(), EcsError> {
        builder.read::<T>()
    }

    fn prepare<'a>(ctx: &RowContext<'a>) -> Result<Ref<'a, [T]>, EcsError> {
        ctx.column::<T>()
    }

    fn fetch<'s>(state: &'s mut Ref<'_, [T]>, row: usize, _: Entity) -> &'s T {
        &state[row]
    }
}

impl<T: Component> KernelParam for Changed<T> {
    type State<'a> = Ref<'a, [T]>;
    type Item<'s> = &'s T;

    fn describe(builder: &mut DescriptorBuilder<'_>) -> Result<(), EcsError> {
        builder.changed::<T>()
    }

    fn prepare<'a>(ctx: &RowContext<'a>) -> Result<Ref<'a, [T]>, EcsError> {
        ctx.column::<T>()
    }

    fn fetch<'s>(state: &'s mut Ref<'_, [T]>, row: usize, _: Entity) -> &'s T {
        &state[row]
    }
}

macro_rules! impl_write_param {
    ($marker:ident, $describe:ident) => {
        impl<T: Component> KernelParam for $marker<T> {
            type State<'a> = RefMut<'a, [T]>;
            type Item<'s> = &'s mut T;

            fn describe(builder: &mut DescriptorBuilder<'_>) -> Result<(), EcsError> {
                builder.$describe::<T>()
            }

            fn prepare<'a>(ctx: &RowContext<'a>) -> Result<RefMut<'a, [T]>, EcsError> {
                ctx.column_mut::<T>()
            }

            fn fetch<'s>(state: &'s mut RefMut<'_, [T]>, row: usize, _: Entity) -> &'s mut T {
                &mut state[row]
            }
        }
    };
}

impl_write_param!(Write, write);
impl_write_param!(Out, create);
impl_write_param!(Banned, create_banned);

impl<T: Component> KernelParam for Without<T> {
    type State<'a> = ();
    type Item<'s> = ();

    fn describe(builder: &mut DescriptorBuilder<'_>) -> Result<(), EcsError> {
        builder.exclude::<T>()
    }

    fn prepare<'a>(_: &RowContext<'a>) -> Result<(), EcsError> {
        Ok(())
    }

    fn fetch<'s>(_: &'s mut (), _: usize, _: Entity) {}
}

impl<T: 'static> KernelParam for Global<T> {
    type State<'a> = Ref<'a, T>;
    type Item<'s> = &'s T;

    fn describe(builder: &mut DescriptorBuilder<'_>) -> Result<(), EcsError> {
        builder.global::<T>(false)
    }

    fn prepare<'a>(ctx: &RowContext<'a>) -> Result<Ref<'a, T>, EcsError> {
        match ctx.globals.borrow::<T>() {
            Ok(Some(global)) => Ok(global),
            Ok(None) => Err(EcsError::GlobalNotPresent {
                name: std::any::type_name::<T>(),
            }),
            Err(()) => Err(ctx.borrow_conflict(std::any::type_name::<T>())),
        }
    }

    fn fetch<'s>(state: &'s mut Ref<'_, T>, _: usize, _: Entity) -> &'s T {
        &**state
    }
}

impl<T: 'static> KernelParam for GlobalMut<T> {
    type State<'a> = RefMut<'a, T>;
    type Item<'s> = &'s mut T;

    fn describe(builder: &mut DescriptorBuilder<'_>) -> Result<(), EcsError> {
        builder.global::<T>(true)
    }

    fn prepare<'a>(ctx: &RowContext<'a>) -> Result<RefMut<'a, T>, EcsError> {
        match ctx.globals.borrow_mut::<T>() {
            Ok(Some(global)) => Ok(global),
            Ok(None) => Err(EcsError::GlobalNotPresent {
                name: std::any::type_name::<T>(),
            }),
            Err(()) => Err(ctx.borrow_conflict(std::any::type_name::<T>())),
        }
    }

    fn fetch<'s>(state: &'s mut RefMut<'_, T>, _: usize, _: Entity) -> &'s mut T {
        &mut **state
    }
}

impl KernelParam for Deferred {
    type State<'a> = Commands<'a>;
    type Item<'s> = Commands<'s>;

    fn describe(_: &mut DescriptorBuilder<'_>) -> Result<(), EcsError> {
        Ok(())
    }

    fn prepare<'a>(ctx: &RowContext<'a>) -> Result<Commands<'a>, EcsError> {
        Ok(ctx.commands.commands())
    }

    fn fetch<'s>(state: &'s mut Commands<'_>, _: usize, _: Entity) -> Commands<'s> {
        *state
    }
}

impl KernelParam for () {
    type State<'a> = ();
    type Item<'s> = ();

    fn describe(_: &mut DescriptorBuilder<'_>) -> Result<(), EcsError> {
        Ok(())
    }

    fn prepare<'a>(_: &RowContext<'a>) -> Result<(), EcsError> {
        Ok(())
    }

    fn fetch<'s>(_: &'s mut (), _: usize, _: Entity) {}
}

macro_rules! impl_param_tuple {
    ($($name:ident),+) => {
        impl<$($name: KernelParam),+> KernelParam for ($($name,)+) {
            type State<'a> = ($($name::State<'a>,)+);
            type Item<'s> = ($($name::Item<'s>,)+);

            fn describe(builder: &mut DescriptorBuilder<'_>) -> Result<(), EcsError> {
                $($name::describe(builder)?;)+
                Ok(())
            }

            fn prepare<'a>(ctx: &RowContext<'a>) -> Result<Self::State<'a>, EcsError> {
                Ok(($($name::prepare(ctx)?,)+))
            }

            #[allow(non_snake_case)]
            fn fetch<'s>(
                state: &'s mut Self::State<'_>,
                row: usize,
                entity: Entity,
            ) -> Self::Item<'s> {
                let ($($name,)+) = state;
                ($($name::fetch($name, row, entity),)+)
            }
        }
    };
}

impl_param_tuple!(A);
impl_param_tuple!(A, B);
impl_param_tuple!(A, B, C);
impl_param_tuple!(A, B, C, D);
impl_param_tuple!(A, B, C, D, E);
impl_param_tuple!(A, B, C, D, E, F);
impl_param_tuple!(A, B, C, D, E, F, G);
impl_param_tuple!(A, B, C, D, E, F, G, H);

// ---------------------------------------------------------------------------
// RowContext
// ---------------------------------------------------------------------------

/// Everything a parameter may borrow from while one archetype is dispatched.
pub struct RowContext<'a> {
    kernel: &'static str,
    archetype: ArchetypeId,
    components: &'a ComponentRegistry,
    columns: &'a LentColumns,
    globals: &'a LentGlobals,
    commands: &'a CommandQueue,
}

impl<'a> RowContext<'a> {
    fn lookup<T: Component>(&self) -> Result<&'a RefCell<Box<dyn ColumnStorage>>, EcsError> {
        let id = self.components.require::<T>()?;
        let columns: &'a LentColumns = self.columns;
        columns
            .binary_search_by_key(&id, |(ty, _)| *ty)
            .map(|i| &columns[i].1)
            .map_err(|_| self.missing(id))
    }

    fn missing(&self, component: ComponentTypeId) -> EcsError {
        EcsError::ArchetypeComponentMissing {
            archetype: self.archetype,
            component: self.components.name_of(component).to_owned(),
        }
    }

    fn borrow_conflict(&self, what: &str) -> EcsError {
        EcsError::QueryConfiguration {
            kernel: self.kernel,
            details: format!("`{what}` is already borrowed by another parameter"),
        }
    }

    /// Shared borrow of this archetype's `T` column.
    pub fn column<T: Component>(&self) -> Result<Ref<'a, [T]>, EcsError> {
        let cell = self.lookup::<T>()?;
        let guard = cell
            .try_borrow()
            .map_err(|_| self.borrow_conflict(std::any::type_name::<T>()))?;
        Ref::filter_map(guard, |column| downcast_slice::<T>(&**column))
            .map_err(|_| self.missing_type::<T>())
    }

    /// Exclusive borrow of this archetype's `T` column.
    pub fn column_mut<T: Component>(&self) -> Result<RefMut<'a, [T]>, EcsError> {
        let cell = self.lookup::<T>()?;
        let guard = cell
            .try_borrow_mut()
            .map_err(|_| self.borrow_conflict(std::any::type_name::<T>()))?;
        RefMut::filter_map(guard, |column| downcast_slice_mut::<T>(&mut **column))
            .map_err(|_| self.missing_type::<T>())
    }

    fn missing_type<T: Component>(&self) -> EcsError {
        match self.components.lookup::<T>() {
            Some(id) => self.missing(id),
            None => EcsError::ArchetypeComponentMissing {
                archetype: self.archetype,
                component: std::any::type_name::<T>().to_owned(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// KernelDescriptor
// ---------------------------------------------------------------------------

/// What a kernel's parameter list asks of the archetypes it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDescriptor {
    pub name: &'static str,
    /// Types an archetype must hold.
    pub required: Vec<ComponentTypeId>,
    /// Types an archetype must not hold.
    pub banned: Vec<ComponentTypeId>,
    /// Types materialized on matching archetypes that lack them.
    pub created: Vec<ComponentTypeId>,
    /// Types whose observers select the rows to visit.
    pub changed: Vec<ComponentTypeId>,
    /// Types written by the kernel, marked changed after each run.
    pub touched: Vec<ComponentTypeId>,
}

impl KernelDescriptor {
    /// Whether an archetype holding `archetype` matches.
    pub fn matches(&self, archetype: &Archetype) -> bool {
        let set = archetype.component_set();
        set.is_superset(&self.required) && !set.intersects(&self.banned)
    }
}

/// Accumulates parameter declarations and validates them into a
/// [`KernelDescriptor`].
pub struct DescriptorBuilder<'r> {
    kernel: &'static str,
    components: &'r ComponentRegistry,
    /// `(component, mutable)` per declared borrow.
    accesses: Vec<(ComponentTypeId, bool)>,
    globals: Vec<(TypeId, &'static str, bool)>,
    required: Vec<ComponentTypeId>,
    banned: Vec<ComponentTypeId>,
    created: Vec<ComponentTypeId>,
    changed: Vec<ComponentTypeId>,
    touched: Vec<ComponentTypeId>,
}

impl<'r> DescriptorBuilder<'r> {
    pub fn new(kernel: &'static str, components: &'r ComponentRegistry) -> Self {
        Self {
            kernel,
            components,
            accesses: Vec::new(),
            globals: Vec::new(),
            required: Vec::new(),
            banned: Vec::new(),
            created: Vec::new(),
            changed: Vec::new(),
            touched: Vec::new(),
        }
    }

    fn error(&self, details: String) -> EcsError {
        EcsError::QueryConfiguration {
            kernel: self.kernel,
            details,
        }
    }

    fn component<T: Component>(&self) -> Result<ComponentTypeId, EcsError> {
        if TypeId::of::<T>() == TypeId::of::<Entity>() {
            return Err(self.error(
                "`Entity` cannot be borrowed as a component; take it by value".to_owned(),
            ));
        }
        self.components.require::<T>()
    }

    pub fn read<T: Component>(&mut self) -> Result<(), EcsError> {
        let id = self.component::<T>()?;
        self.accesses.push((id, false));
        self.required.push(id);
        Ok(())
    }

    pub fn write<T: Component>(&mut self) -> Result<(), EcsError> {
        let id = self.component::<T>()?;
        self.accesses.push((id, true));
        self.required.push(id);
        self.touched.push(id);
        Ok(())
    }

    pub fn changed<T: Component>(&mut self) -> Result<(), EcsError> {
        self.read::<T>()?;
        let id = self.component::<T>()?;
        self.changed.push(id);
        Ok(())
    }

    pub fn create<T: Component>(&mut self) -> Result<(), EcsError> {
        let id = self.component::<T>()?;
        self.accesses.push((id, true));
        self.created.push(id);
        self.touched.push(id);
        Ok(())
    }

    pub fn create_banned<T: Component>(&mut self) -> Result<(), EcsError> {
        self.create::<T>()?;
        let id = self.component::<T>()?;
        self.banned.push(id);
        Ok(())
    }

    pub fn exclude<T: Component>(&mut self) -> Result<(), EcsError> {
        let id = self.component::<T>()?;
        self.banned.push(id);
        Ok(())
    }

    pub fn global<T: 'static>(&mut self, mutable: bool) -> Result<(), EcsError> {
        self.globals
            .push((TypeId::of::<T>(), std::any::type_name::<T>(), mutable));
        Ok(())
    }

    /// Validate the declarations.
    pub fn build(self) -> Result<KernelDescriptor, EcsError> {
        for (i, &(id, mutable)) in self.accesses.iter().enumerate() {
            let clash = self
                .accesses
                .iter()
                .enumerate()
                .any(|(j, &(other, other_mut))| i != j && other == id && (mutable || other_mut));
            if clash {
                return Err(self.error(format!(
                    "component '{}' is borrowed mutably alongside another borrow",
                    self.components.name_of(id)
                )));
            }
        }
        if let Some(id) = self.required.iter().find(|id| self.banned.contains(id)) {
            return Err(self.error(format!(
                "component '{}' is both required and excluded",
                self.components.name_of(*id)
            )));
        }
        for (i, &(ty, name, mutable)) in self.globals.iter().enumerate() {
            let clash = self
                .globals
                .iter()
                .enumerate()
                .any(|(j, &(other, _, other_mut))| i != j && other == ty && (mutable || other_mut));
            if clash {
                return Err(self.error(format!(
                    "global '{name}' is borrowed mutably alongside another borrow"
                )));
            }
        }

        fn canonical(mut ids: Vec<ComponentTypeId>) -> Vec<ComponentTypeId> {
            ids.sort_unstable();
            ids.dedup();
            ids
        }

        Ok(KernelDescriptor {
            name: self.kernel,
            required: canonical(self.required),
            banned: canonical(self.banned),
            created: canonical(self.created),
            changed: canonical(self.changed),
            touched: canonical(self.touched),
        })
    }
}

// ---------------------------------------------------------------------------
// DispatchReport
// ---------------------------------------------------------------------------

/// Counters from one [`Scene::run_kernel`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Archetypes whose component set matched the descriptor.
    pub archetypes_matched: usize,
    /// Total kernel invocations.
    pub rows_invoked: usize,
    /// Archetypes visited over their whole occupied range.
    pub full_scans: usize,
    /// Archetypes visited only at their dirty rows.
    pub partial_scans: usize,
    /// Containers folded into another by the post-run table rebuild.
    pub merged_archetypes: usize,
    /// Deferred commands applied successfully.
    pub commands_applied: usize,
    /// Deferred commands that failed.
    pub commands_failed: usize,
}

enum Selection {
    Full,
    Rows(BTreeSet<usize>),
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

impl Scene {
    /// Descriptor for `K`, built on first use and cached per
    /// `(kernel type, name)`.
    pub fn kernel_descriptor<K: Kernel>(&mut self) -> Result<Rc<KernelDescriptor>, EcsError> {
        let key = (TypeId::of::<K>(), K::NAME);
        if let Some(descriptor) = self.kernels.get(&key) {
            return Ok(Rc::clone(descriptor));
        }
        let mut builder = DescriptorBuilder::new(K::NAME, &self.components);
        K::Params::describe(&mut builder)?;
        let descriptor = Rc::new(builder.build()?);
        for &ty in &descriptor.changed {
            self.observers
                .entry(ty)
                .or_insert_with(|| ComponentObserver::new(ty));
        }
        debug!(
            kernel = K::NAME,
            required = descriptor.required.len(),
            banned = descriptor.banned.len(),
            created = descriptor.created.len(),
            changed = descriptor.changed.len(),
            "kernel descriptor built"
        );
        self.kernels.insert(key, Rc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Flush staged changes, then run `kernel` over every matching archetype.
    ///
    /// Deferred commands recorded by the kernel are applied after the run.
    pub fn run_kernel<K: Kernel>(&mut self, kernel: &mut K) -> Result<DispatchReport, EcsError> {
        let descriptor = self.kernel_descriptor::<K>()?;
        self.flush();

        let mut report = DispatchReport::default();
        let mut materialized = false;
        let queue = CommandQueue::new();
        let globals = self.globals.lend();
        let result = self.dispatch(kernel, &descriptor, &globals, &queue, &mut report, &mut materialized);
        self.globals.restore(globals);

        if materialized {
            report.merged_archetypes = self.rebuild_archetype_table();
        }
        result?;

        let applied = queue.apply(self);
        report.commands_applied = applied.success_count;
        report.commands_failed = applied.failed_count;

        debug!(
            kernel = K::NAME,
            archetypes = report.archetypes_matched,
            rows = report.rows_invoked,
            full = report.full_scans,
            partial = report.partial_scans,
            merged = report.merged_archetypes,
            "kernel dispatched"
        );
        Ok(report)
    }

    fn dispatch<K: Kernel>(
        &mut self,
        kernel: &mut K,
        descriptor: &KernelDescriptor,
        globals: &LentGlobals,
        queue: &CommandQueue,
        report: &mut DispatchReport,
        materialized: &mut bool,
    ) -> Result<(), EcsError> {
        for id in self.archetypes.ids() {
            let matches = self
                .archetypes
                .get(id)
                .is_some_and(|arch| descriptor.matches(arch));
            if !matches {
                continue;
            }
            report.archetypes_matched += 1;

            let selection = self.select_rows(id, descriptor);

            let Some(arch) = self.archetypes.get_mut(id) else {
                continue;
            };
            for &ty in &descriptor.created {
                if arch.has_column(ty) {
                    continue;
                }
                if let Some(info) = self.components.get_info(ty) {
                    arch.add_column(info);
                    *materialized = true;
                    trace!(archetype = ?id, component = %info.name, "column materialized");
                }
            }

            let lent = arch.lend_columns();
            let invoked = {
                let ctx = RowContext {
                    kernel: K::NAME,
                    archetype: id,
                    components: &self.components,
                    columns: &lent,
                    globals,
                    commands: queue,
                };
                execute(kernel, &ctx, arch, &selection)
            };
            arch.restore_columns(lent);
            let invoked = invoked?;
            self.consume_changed(id, descriptor);

            report.rows_invoked += invoked.len();
            match selection {
                Selection::Full => {
                    report.full_scans += 1;
                    trace!(kernel = K::NAME, archetype = ?id, rows = invoked.len(), "full scan");
                    for ty in &descriptor.touched {
                        if let Some(observer) = self.observers.get_mut(ty) {
                            observer.mark_all_changed(id);
                        }
                    }
                }
                Selection::Rows(_) => {
                    report.partial_scans += 1;
                    trace!(kernel = K::NAME, archetype = ?id, rows = invoked.len(), "partial scan");
                    for ty in &descriptor.touched {
                        if let Some(observer) = self.observers.get_mut(ty) {
                            for &row in &invoked {
                                observer.mark_changed_or_added(id, row);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Decide which rows of `archetype` a run visits. The dirty sets are
    /// left in place until the run succeeds.
    fn select_rows(&self, archetype: ArchetypeId, descriptor: &KernelDescriptor) -> Selection {
        if descriptor.changed.is_empty() {
            return Selection::Full;
        }
        let mut rows = BTreeSet::new();
        for ty in &descriptor.changed {
            match self.observers.get(ty).and_then(|o| o.tracked_rows(archetype)) {
                Some(dirty) => rows.extend(dirty.iter().copied()),
                None => return Selection::Full,
            }
        }
        Selection::Rows(rows)
    }

    /// Restart change accumulation on `archetype` for every changed-filter
    /// type once its rows have been visited.
    fn consume_changed(&mut self, archetype: ArchetypeId, descriptor: &KernelDescriptor) {
        for &ty in &descriptor.changed {
            self.observers
                .entry(ty)
                .or_insert_with(|| ComponentObserver::new(ty))
                .clear(archetype);
        }
    }
}

/// Invoke `kernel` on the selected occupied rows. Returns the rows visited.
fn execute<K: Kernel>(
    kernel: &mut K,
    ctx: &RowContext<'_>,
    archetype: &Archetype,
    selection: &Selection,
) -> Result<Vec<usize>, EcsError> {
    let mut state = K::Params::prepare(ctx)?;
    let mut invoked = Vec::new();
    let mut visit = |row: usize| {
        if let Some(entity) = archetype.entity_at(row) {
            kernel.run(K::Params::fetch(&mut state, row, entity));
            invoked.push(row);
        }
    };
    match selection {
        Selection::Full => (0..archetype.end()).for_each(&mut visit),
        Selection::Rows(rows) => rows
            .iter()
            .copied()
            .filter(|&row| row < archetype.end())
            .for_each(&mut visit),
    }
    Ok(invoked)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct A(i32);

    #[derive(Debug, Default, Clone, PartialEq)]
    struct B(i32);

    fn registry() -> ComponentRegistry {
        let mut reg = ComponentRegistry::new();
        reg.register::<A>("a");
        reg.register::<B>("b");
        reg
    }

    fn describe<P: KernelParam>(reg: &ComponentRegistry) -> Result<KernelDescriptor, EcsError> {
        let mut builder = DescriptorBuilder::new("test", reg);
        P::describe(&mut builder)?;
        builder.build()
    }

    #[test]
    fn descriptor_collects_roles() {
        let reg = registry();
        let a = reg.lookup::<A>().unwrap();
        let b = reg.lookup::<B>().unwrap();

        let d = describe::<(Entity, Changed<A>, Out<B>)>(&reg).unwrap();
        assert_eq!(d.required, vec![a]);
        assert_eq!(d.changed, vec![a]);
        assert_eq!(d.created, vec![b]);
        assert_eq!(d.touched, vec![b]);
        assert!(d.banned.is_empty());

        let d = describe::<(Read<A>, Banned<B>)>(&reg).unwrap();
        assert_eq!(d.banned, vec![b]);
        assert_eq!(d.created, vec![b]);
    }

    #[test]
    fn shared_reads_are_allowed() {
        let reg = registry();
        assert!(describe::<(Read<A>, Changed<A>, Global<u32>, Global<u32>)>(&reg).is_ok());
    }

    #[test]
    fn aliased_write_is_rejected() {
        let reg = registry();
        for result in [
            describe::<(Write<A>, Read<A>)>(&reg),
            describe::<(Write<A>, Write<A>)>(&reg),
            describe::<(Changed<A>, Out<A>)>(&reg),
            describe::<(GlobalMut<u32>, Global<u32>)>(&reg),
        ] {
            assert!(matches!(result, Err(EcsError::QueryConfiguration { .. })));
        }
    }

    #[test]
    fn required_and_excluded_is_rejected() {
        let reg = registry();
        let err = describe::<(Read<A>, Without<A>)>(&reg).unwrap_err();
        assert!(err.to_string().contains("both required and excluded"), "{err}");
    }

    #[test]
    fn entity_borrowed_as_component_is_rejected() {
        let reg = registry();
        assert!(matches!(
            describe::<(Write<Entity>, Read<A>)>(&reg),
            Err(EcsError::QueryConfiguration { .. })
        ));
    }

    #[test]
    fn unregistered_component_is_reported() {
        let reg = registry();
        assert!(matches!(
            describe::<Read<String>>(&reg),
            Err(EcsError::UnknownComponent { .. })
        ));
    }
}
