//! Instruction template and prompt assembly for the intake dialogue.

use crate::intake::model::MessageLogEntry;

/// Instruction template sent with every turn.
///
/// `{history}` and `{input}` are filled by [`PromptBuilder::build`]. The
/// output contract (keys, double quotes, always a `step`) is what
/// [`crate::intake::interpreter`] decodes.
pub const INTAKE_TEMPLATE: &str = r#"Eres un asistente amigable y servicial de una tienda de mascotas.
Tu objetivo es ayudar a los clientes a recordar sus próximas compras. Considera que cada cliente es un cliente reciente.

Debes seguir estos pasos en orden jerárquico. No pases al siguiente paso hasta que el actual esté completo:

1. Saluda al cliente y preséntate, pregúntale si desea programar un recordatorio para su próxima compra.
2. Si dice que sí, pregunta el intervalo de tiempo en semanas.
   - Si el usuario especifica un intervalo de tiempo, debes:
     * Calcular el número equivalente de SEMANAS (como un NÚMERO ENTERO).
     * Incluir una clave "intervalo" en tu respuesta con ese valor numérico.
     * Si el usuario no especifica un intervalo después de solicitarlo, NO incluyas la clave "intervalo" en tu respuesta.
3. Solicita el nombre de su mascota de manera amable y animosa.
4. Solicita los alimentos favoritos de su mascota de manera amable y animosa.
5. Solicita la raza de su mascota de manera amable y animosa.
6. Confirma al usuario que se ha programado un recordatorio para la próxima compra de alimento de [preferencia] para [Nombre_mascota].

Siempre sé amable, empático y usa un lenguaje formal.

Devuelve tu respuesta SIEMPRE como un objeto JSON con estas reglas:

1. SIEMPRE incluye la clave "respuesta" con el texto conversacional para el usuario.
2. SOLO si el usuario proporciona un intervalo de tiempo, añade la clave "intervalo" con el número de semanas.
3. SOLO si el usuario proporciona el nombre de su mascota, añade la clave "Nombre_mascota".
4. SOLO si el usuario proporciona alguna preferencia de comida para su mascota, añade la clave "preferencia".
5. SOLO si el usuario proporciona la raza de su mascota, añade la clave "raza_mascota".
6. SIEMPRE incluye la clave "step" con el número del paso actual en la conversación.

IMPORTANTE:
- Devuelve SOLO el objeto, sin texto adicional antes o después.
- No incluyas la palabra "json" ni ninguna otra explicación.
- Usa SIEMPRE comillas dobles para las claves y los valores de texto.

Ejemplos de formato correcto:
- Paso 1: {"respuesta": "¡Hola! Soy el asistente de la tienda de mascotas, ¿le gustaría que le programemos un recordatorio para su próxima compra?", "step": 1}
- Paso 2: {"respuesta": "¡Perfecto! ¿En cuántas semanas le gustaría recibir un recordatorio de su próxima compra?", "step": 2}
- Paso 3: {"respuesta": "¡Genial! ¿Cuál es el nombre de su mascota?", "step": 3, "intervalo": 8}
- Paso 4: {"respuesta": "¡Excelente! ¿Qué alimentos le gustan a su mascota?", "step": 4, "Nombre_mascota": "Firulais"}
- Paso 5: {"respuesta": "¡Maravilloso! ¿Y cuál es la raza de su mascota?", "step": 5, "preferencia": "Royal Canin"}
- Paso 6: {"respuesta": "¡Excelente! Le recordaremos su próxima compra de Royal Canin para Firulais.", "step": 6, "raza_mascota": "Golden Retriever"}

{history}Cliente: {input}
"#;

/// Assembles the per-turn prompt from the template, recent history and the
/// new message. Holds no per-user state.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    template: String,
    window: usize,
}

impl PromptBuilder {
    pub fn new(window: usize) -> Self {
        Self::with_template(INTAKE_TEMPLATE, window)
    }

    pub fn with_template(template: &str, window: usize) -> Self {
        Self {
            template: template.to_string(),
            window,
        }
    }

    /// How many history entries [`build`](Self::build) will use.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Build the prompt.
    ///
    /// `history` is expected most recent first, as the store returns it. Only
    /// inbound entries are used, at most `window` of them, in that order.
    pub fn build(&self, history: &[MessageLogEntry], input: &str) -> String {
        let transcript: String = history
            .iter()
            .filter(|e| e.direction == crate::intake::model::Direction::Inbound)
            .take(self.window)
            .map(|e| format!("Cliente: {}\n", e.text))
            .collect();

        render(&self.template, &transcript, input)
    }
}

/// Single left-to-right substitution pass, so placeholder text inside user
/// messages is never expanded.
fn render(template: &str, history: &str, input: &str) -> String {
    const HISTORY: &str = "{history}";
    const INPUT: &str = "{input}";

    let mut out = String::with_capacity(template.len() + history.len() + input.len());
    let mut rest = template;
    loop {
        let next = [(rest.find(HISTORY), HISTORY, history), (rest.find(INPUT), INPUT, input)]
            .into_iter()
            .filter_map(|(pos, token, value)| pos.map(|p| (p, token, value)))
            .min_by_key(|(pos, _, _)| *pos);

        match next {
            Some((pos, token, value)) => {
                out.push_str(&rest[..pos]);
                out.push_str(value);
                rest = &rest[pos + token.len()..];
            }
            None => {
                out.push_str(rest);
                return out;
            }
        }
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_HISTORY_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn inbound(text: &str, minute: u32) -> MessageLogEntry {
        let ts = Utc.with_ymd_and_hms(2025, 3, 15, 10, minute, 0).unwrap();
        MessageLogEntry::inbound("a", text, ts, "SRR", 0)
    }

    fn outbound(text: &str, minute: u32) -> MessageLogEntry {
        let ts = Utc.with_ymd_and_hms(2025, 3, 15, 10, minute, 0).unwrap();
        MessageLogEntry::outbound("a", text, ts, "SRR", 0)
    }

    #[test]
    fn empty_history_ends_with_input() {
        let prompt = PromptBuilder::default().build(&[], "Hola");
        assert!(prompt.ends_with("Cliente: Hola\n"));
        assert!(prompt.starts_with("Eres un asistente"));
        assert!(!prompt.contains("{history}"));
        assert!(!prompt.contains("{input}"));
    }

    #[test]
    fn history_is_inbound_only_and_windowed() {
        let history = vec![
            inbound("cuatro", 4),
            outbound("respuesta", 3),
            inbound("tres", 3),
            inbound("dos", 2),
            inbound("uno", 1),
        ];
        let prompt = PromptBuilder::new(3).build(&history, "cinco");

        assert!(prompt.ends_with("Cliente: cuatro\nCliente: tres\nCliente: dos\nCliente: cinco\n"));
        assert!(!prompt.contains("Cliente: uno"));
        assert!(!prompt.contains("Cliente: respuesta"));
    }

    #[test]
    fn placeholders_in_user_text_are_literal() {
        let builder = PromptBuilder::with_template("{history}|{input}", 3);
        let prompt = builder.build(&[inbound("{input}", 1)], "{history}");
        assert_eq!(prompt, "Cliente: {input}\n|{history}");
    }

    #[test]
    fn build_is_deterministic() {
        let builder = PromptBuilder::new(2);
        let history = vec![inbound("Sí", 2), inbound("Hola", 1)];
        assert_eq!(
            builder.build(&history, "En dos meses"),
            builder.build(&history, "En dos meses")
        );
    }

    #[test]
    fn custom_template() {
        let builder = PromptBuilder::with_template("H:{history}I:{input}", 1);
        assert_eq!(builder.build(&[inbound("x", 1)], "y"), "H:Cliente: x\nI:y");
    }

    #[test]
    fn template_examples_are_valid_json() {
        for line in INTAKE_TEMPLATE.lines().filter(|l| l.starts_with("- Paso")) {
            let start = line.find('{').unwrap();
            let value: serde_json::Value = serde_json::from_str(&line[start..]).unwrap();
            assert!(value.get("respuesta").is_some());
            assert!(value.get("step").is_some());
        }
    }
}
