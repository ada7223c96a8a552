// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-local identifiers.
//!
//! `define_id!` declares a `u32` newtype drawn from its own counter, shown
//! with a short prefix (`hba0`, `hba1`, ...).  Useful for telling objects
//! apart in logs and probes; meaningless outside the process.

macro_rules! define_id {
    {
        $(#[$attr:meta])*
        $vis:vis $name:ident, $prefix:literal
    } => {
        ::paste::paste! {
            $(#[$attr])*
            #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
            $vis struct $name(u32);

            static [<NEXT_ $name:upper>]: ::std::sync::atomic::AtomicU32 =
                ::std::sync::atomic::AtomicU32::new(0);

            impl $name {
                pub fn next() -> Self {
                    use ::std::sync::atomic::Ordering;
                    Self([<NEXT_ $name:upper>].fetch_add(1, Ordering::Relaxed))
                }

                pub fn get(self) -> u32 {
                    self.0
                }
            }

            impl ::std::fmt::Display for $name {
                fn fmt(
                    &self,
                    f: &mut ::std::fmt::Formatter<'_>,
                ) -> ::std::fmt::Result {
                    write!(f, concat!($prefix, "{}"), self.0)
                }
            }
        }
    };
}
pub(crate) use define_id;

#[cfg(test)]
mod test {
    define_id! {
        pub(crate) WidgetId, "w"
    }

    #[test]
    fn ids_count_up_with_prefix() {
        let a = WidgetId::next();
        let b = WidgetId::next();
        assert!(b > a);
        assert_eq!(b.get(), a.get() + 1);
        assert_eq!(a.to_string(), format!("w{}", a.get()));
    }
}
