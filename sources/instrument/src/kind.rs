use std::fmt::Display;

/// The families of instrumentation, each with its own block of constant pool
/// entries naming the runtime methods it calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InjectionKind {
    NormalMethod,
    RootMethod,
    MarkerMethod,
    SampledNormalMethod,
    SampledRootMethod,
    SampledMarkerMethod,
    ReflectMethodInvoke,
    ServletDoMethod,
    CodeRegion,
    ObjectAllocations,
    ObjectLiveness,
}

impl InjectionKind {
    pub const COUNT: usize = 11;

    pub const ALL: [InjectionKind; InjectionKind::COUNT] = [
        InjectionKind::NormalMethod,
        InjectionKind::RootMethod,
        InjectionKind::MarkerMethod,
        InjectionKind::SampledNormalMethod,
        InjectionKind::SampledRootMethod,
        InjectionKind::SampledMarkerMethod,
        InjectionKind::ReflectMethodInvoke,
        InjectionKind::ServletDoMethod,
        InjectionKind::CodeRegion,
        InjectionKind::ObjectAllocations,
        InjectionKind::ObjectLiveness,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The kind whose entries this kind's fragment refers to.
    pub fn dependency(self) -> Option<InjectionKind> {
        match self {
            InjectionKind::RootMethod | InjectionKind::MarkerMethod => {
                Some(InjectionKind::NormalMethod)
            }
            InjectionKind::SampledRootMethod | InjectionKind::SampledMarkerMethod => {
                Some(InjectionKind::SampledNormalMethod)
            }
            _ => None,
        }
    }

    pub fn is_sampled(self) -> bool {
        matches!(
            self,
            InjectionKind::SampledNormalMethod
                | InjectionKind::SampledRootMethod
                | InjectionKind::SampledMarkerMethod
        )
    }
}

impl Display for InjectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InjectionKind::NormalMethod => "normal",
            InjectionKind::RootMethod => "root",
            InjectionKind::MarkerMethod => "marker",
            InjectionKind::SampledNormalMethod => "sampled-normal",
            InjectionKind::SampledRootMethod => "sampled-root",
            InjectionKind::SampledMarkerMethod => "sampled-marker",
            InjectionKind::ReflectMethodInvoke => "reflect-invoke",
            InjectionKind::ServletDoMethod => "servlet",
            InjectionKind::CodeRegion => "code-region",
            InjectionKind::ObjectAllocations => "allocations",
            InjectionKind::ObjectLiveness => "liveness",
        };

        f.write_str(name)
    }
}
