/// Types with a constant default value, usable to initialize `static`s.
pub trait Init {
    /// The constant default value.
    const INIT: Self;
}

macro_rules! impl_init_int {
    ($($ty:ty),*) => {
        $(impl Init for $ty {
            const INIT: Self = 0;
        })*
    };
}

impl_init_int!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl Init for bool {
    const INIT: Self = false;
}

impl Init for () {
    const INIT: Self = ();
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: Init, E> Init for Result<T, E> {
    const INIT: Self = Ok(T::INIT);
}

impl<T: Init, const N: usize> Init for [T; N] {
    const INIT: Self = [T::INIT; N];
}
