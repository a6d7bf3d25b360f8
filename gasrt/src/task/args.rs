/// Argument tuples a task function can be applied to.
///
/// Implemented for tuples of up to twelve elements. Arguments are moved into
/// the task when it is spawned, so the task owns its own copies and never
/// observes later changes made by the spawner.
///
/// ```
/// use gasrt::task::Apply;
///
/// fn sum(a: i32, b: i32) -> i32 {
///     a + b
/// }
///
/// assert_eq!((5, 10).apply(sum), 15);
/// assert_eq!(().apply(|| "no args"), "no args");
/// ```
pub trait Apply<F> {
    type Output;

    fn apply(self, f: F) -> Self::Output;
}

macro_rules! impl_apply {
    ($($arg:ident),*) => {
        impl<Func, Ret, $($arg,)*> Apply<Func> for ($($arg,)*)
        where
            Func: FnOnce($($arg),*) -> Ret,
        {
            type Output = Ret;

            #[allow(non_snake_case)]
            fn apply(self, f: Func) -> Self::Output {
                let ($($arg,)*) = self;
                f($($arg),*)
            }
        }
    };
}

impl_apply!();
impl_apply!(A0);
impl_apply!(A0, A1);
impl_apply!(A0, A1, A2);
impl_apply!(A0, A1, A2, A3);
impl_apply!(A0, A1, A2, A3, A4);
impl_apply!(A0, A1, A2, A3, A4, A5);
impl_apply!(A0, A1, A2, A3, A4, A5, A6);
impl_apply!(A0, A1, A2, A3, A4, A5, A6, A7);
impl_apply!(A0, A1, A2, A3, A4, A5, A6, A7, A8);
impl_apply!(A0, A1, A2, A3, A4, A5, A6, A7, A8, A9);
impl_apply!(A0, A1, A2, A3, A4, A5, A6, A7, A8, A9, A10);
impl_apply!(A0, A1, A2, A3, A4, A5, A6, A7, A8, A9, A10, A11);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_moves_arguments() {
        let name = String::from("gasrt");
        let len = (name,).apply(|s: String| s.len());
        assert_eq!(len, 5);
    }

    #[allow(clippy::too_many_arguments)]
    fn sum12(
        a: u32, b: u32, c: u32, d: u32, e: u32, f: u32,
        g: u32, h: u32, i: u32, j: u32, k: u32, l: u32,
    ) -> u32 {
        a + b + c + d + e + f + g + h + i + j + k + l
    }

    #[test]
    fn test_apply_max_arity() {
        let total = (1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12).apply(sum12);
        assert_eq!(total, 78);
    }

    #[test]
    fn test_apply_unit_output() {
        let mut hits = 0;
        (3_usize,).apply(|n: usize| hits += n);
        assert_eq!(hits, 3);
    }
}
