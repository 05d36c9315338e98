//! `Reactive<T>`: a value that is either static or backed by the reactive graph.

use std::rc::Rc;

use crate::{ReadSignal, Signal};

/// A value that can be either a plain `T` or a reactive source of `T`.
///
/// A tagged sum type rather than a trait object, so resolving one never needs a dynamic dispatch
/// through a boxed closure. A [`Reactive<T>`] is built from a static value, a
/// [`ReadSignal`]/[`Signal`]/[`crate::Computed`], or a closure, via [`From`]/[`Into`].
#[derive(Clone)]
pub enum Reactive<T>
where
    T: Into<Self> + 'static,
{
    /// A plain, non-reactive value.
    Static(T),
    /// Backed directly by a signal or computed.
    Signal(ReadSignal<T>),
    /// A derived closure, re-evaluated (and flattened) on every read.
    Derived(Rc<dyn Fn() -> Self>),
}

impl<T: Into<Self> + 'static> Reactive<T> {
    /// Resolves to the value by consuming `self`, avoiding a clone when it is already [`Static`].
    ///
    /// [`Static`]: Reactive::Static
    pub fn resolve(self) -> T
    where
        T: Clone,
    {
        match self {
            Self::Static(value) => value,
            Self::Signal(signal) => signal.get_clone(),
            Self::Derived(f) => f().resolve(),
        }
    }

    /// Gets the value by copying it.
    pub fn get(&self) -> T
    where
        T: Copy,
    {
        match self {
            Self::Static(value) => *value,
            Self::Signal(value) => value.get(),
            Self::Derived(f) => f().resolve(),
        }
    }

    /// Gets the value by cloning it.
    pub fn get_clone(&self) -> T
    where
        T: Clone,
    {
        match self {
            Self::Static(value) => value.clone(),
            Self::Signal(value) => value.get_clone(),
            Self::Derived(f) => f().resolve(),
        }
    }

    /// Tracks this value's reactive dependency, if it has one.
    pub fn track(&self) {
        match self {
            Self::Static(_) => {}
            Self::Signal(signal) => signal.track(),
            Self::Derived(f) => f().track(),
        }
    }

    /// Returns `true` if this value is backed by the reactive graph (a signal, computed, or
    /// derived closure) rather than being a plain static value.
    pub fn is_signal(&self) -> bool {
        !matches!(self, Self::Static(_))
    }

    /// Returns the static value without evaluating, or `None` if this is reactive.
    pub fn as_static(&self) -> Option<&T> {
        match self {
            Self::Static(value) => Some(value),
            _ => None,
        }
    }
}

impl<T: Into<Self>> From<ReadSignal<T>> for Reactive<T> {
    fn from(val: ReadSignal<T>) -> Self {
        Reactive::Signal(val)
    }
}

impl<T: Into<Self>> From<Signal<T>> for Reactive<T> {
    fn from(val: Signal<T>) -> Self {
        Reactive::Signal(*val)
    }
}

impl<F, U, T: Into<Self>> From<F> for Reactive<T>
where
    F: Fn() -> U + 'static,
    U: Into<Reactive<T>>,
{
    fn from(f: F) -> Self {
        Reactive::Derived(Rc::new(move || f().into()))
    }
}

/// Generates `From<$ty>` (and optionally `From<$from>`) impls for `Reactive<$ty>`, working around
/// the lack of specialization that would otherwise let one generic impl cover every static type.
#[macro_export]
macro_rules! impl_into_reactive {
    ($ty:ty $(; $($from:ty),*)?) => {
        impl From<$ty> for $crate::Reactive<$ty> {
            fn from(val: $ty) -> Self {
                Reactive::Static(val)
            }
        }

        $(
            $(
                impl From<$from> for $crate::Reactive<$ty> {
                    fn from(val: $from) -> Self {
                        Reactive::Static(val.into())
                    }
                }
            )*
        )?
    };
}

impl_into_reactive!(bool);
impl_into_reactive!(String; &'static str);

impl_into_reactive!(f32);
impl_into_reactive!(f64);

impl_into_reactive!(i8);
impl_into_reactive!(i16);
impl_into_reactive!(i32);
impl_into_reactive!(i64);
impl_into_reactive!(i128);
impl_into_reactive!(isize);
impl_into_reactive!(u8);
impl_into_reactive!(u16);
impl_into_reactive!(u32);
impl_into_reactive!(u64);
impl_into_reactive!(u128);
impl_into_reactive!(usize);

impl<T> From<Vec<T>> for Reactive<Vec<T>> {
    fn from(val: Vec<T>) -> Self {
        Reactive::Static(val)
    }
}

/// Resolves any value convertible into a [`Reactive<T>`] directly to its current `T`.
pub fn resolve<T: Clone + Into<Reactive<T>> + 'static>(value: impl Into<Reactive<T>>) -> T {
    value.into().resolve()
}

/// Returns `true` if the given value is backed by the reactive graph rather than being static.
pub fn is_signal<T: Into<Reactive<T>> + 'static>(value: &Reactive<T>) -> bool {
    value.is_signal()
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn static_value_resolves_without_a_root() {
        let r: Reactive<i32> = 5.into();
        assert!(!r.is_signal());
        assert_eq!(r.resolve(), 5);
    }

    #[test]
    fn signal_value_resolves_through_the_graph() {
        let _ = create_root(|| {
            let state = create_signal(10);
            let r: Reactive<i32> = state.into();
            assert!(r.is_signal());
            assert_eq!(r.get(), 10);
            state.set(20);
            assert_eq!(r.get(), 20);
        });
    }

    #[test]
    fn derived_closure_flattens_to_its_inner_value() {
        let _ = create_root(|| {
            let state = create_signal(1);
            let r: Reactive<i32> = (move || state.get() * 10).into();
            assert!(r.is_signal());
            assert_eq!(r.get(), 10);
            state.set(2);
            assert_eq!(r.get(), 20);
        });
    }
}
