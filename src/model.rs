use serde::{Deserialize, Serialize};

/// Wire/storage codes for every state column. The strings are what the UI and the
/// `estado*` TEXT columns carry, so they stay in Spanish.
macro_rules! state_enum {
    ($name:ident { $($variant:ident => $code:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $code)]
                $variant,
            )+
        }

        impl $name {
            #[allow(dead_code)]
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn parse(s: &str) -> Option<Self> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $code,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

state_enum!(PeriodState {
    Activo => "ACTIVO",
    Finalizado => "FINALIZADO",
});

state_enum!(SupplementaryState {
    Pendiente => "PENDIENTE",
    Activado => "ACTIVADO",
    Cerrado => "CERRADO",
});

state_enum!(TrimesterState {
    Pendiente => "PENDIENTE",
    Activo => "ACTIVO",
    Finalizado => "FINALIZADO",
});

state_enum!(EnrollmentState {
    Activo => "ACTIVO",
    Retirado => "RETIRADO",
    Finalizado => "FINALIZADO",
});

state_enum!(StudentState {
    Activo => "ACTIVO",
    SinMatricula => "SIN_MATRICULA",
    InactivoTemporal => "INACTIVO_TEMPORAL",
    Graduado => "GRADUADO",
    Retirado => "RETIRADO",
});

state_enum!(SectionState {
    Activo => "ACTIVO",
    Inactivo => "INACTIVO",
});

state_enum!(GradingNature {
    Quantitative => "QUANTITATIVE",
    Qualitative => "QUALITATIVE",
});

state_enum!(EvaluationType {
    Insumos => "INSUMOS",
    Proyecto => "PROYECTO",
    Examen => "EXAMEN",
});

state_enum!(Band {
    Da => "DA",
    Aa => "AA",
    Pa => "PA",
    Na => "NA",
});
