//! Keras-like layer table for a converted model.

use std::fmt::Write;

/// One row of the summary.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct LayerInfo {
    pub name: String,
    pub kind: String,
    /// Logical (source model) shape, batch included.
    pub output_shape: Vec<usize>,
    pub trainable: usize,
    pub non_trainable: usize,
}

impl LayerInfo {
    pub fn params(&self) -> usize {
        self.trainable + self.non_trainable
    }
}

const LINE_LENGTH: usize = 65;
const COLUMNS: [usize; 3] = [29, 55, 65];

fn row(out: &mut String, fields: [&str; 3]) {
    let mut line = String::new();
    for (field, &stop) in fields.iter().zip(COLUMNS.iter()) {
        line.push_str(field);
        let mut cut = stop.min(line.len());
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        line.truncate(cut);
        while line.len() < stop {
            line.push(' ');
        }
    }
    let _ = writeln!(out, "{}", line);
}

/// `(None, 3, 224, 224)`, the batch dimension being left free.
pub fn format_shape(shape: &[usize]) -> String {
    let mut dims = vec!["None".to_string()];
    dims.extend(shape.iter().skip(1).map(|d| d.to_string()));
    if dims.len() == 1 { "(None,)".to_string() } else { format!("({})", dims.join(", ")) }
}

/// Integer with thousands separators.
pub fn thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::new();
    for (ix, c) in digits.chars().enumerate() {
        if ix > 0 && (digits.len() - ix) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

pub fn render(layers: &[LayerInfo]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", "_".repeat(LINE_LENGTH));
    row(&mut out, ["Layer (type)", "Output Shape", "Param #"]);
    let _ = writeln!(out, "{}", "=".repeat(LINE_LENGTH));
    for (ix, layer) in layers.iter().enumerate() {
        row(
            &mut out,
            [
                &format!("{} ({})", layer.name, layer.kind),
                &format_shape(&layer.output_shape),
                &layer.params().to_string(),
            ],
        );
        let sep = if ix + 1 == layers.len() { "=" } else { "_" };
        let _ = writeln!(out, "{}", sep.repeat(LINE_LENGTH));
    }
    if layers.is_empty() {
        let _ = writeln!(out, "{}", "=".repeat(LINE_LENGTH));
    }
    let trainable: usize = layers.iter().map(|l| l.trainable).sum();
    let non_trainable: usize = layers.iter().map(|l| l.non_trainable).sum();
    let _ = writeln!(out, "Total params: {}", thousands(trainable + non_trainable));
    let _ = writeln!(out, "Trainable params: {}", thousands(trainable));
    let _ = writeln!(out, "Non-trainable params: {}", thousands(non_trainable));
    let _ = write!(out, "{}", "_".repeat(LINE_LENGTH));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators() {
        assert_eq!(thousands(0), "0");
        assert_eq!(thousands(999), "999");
        assert_eq!(thousands(1000), "1,000");
        assert_eq!(thousands(2_583_728), "2,583,728");
    }

    #[test]
    fn shapes() {
        assert_eq!(format_shape(&[1, 3, 224, 224]), "(None, 3, 224, 224)");
        assert_eq!(format_shape(&[1, 1000]), "(None, 1000)");
    }

    #[test]
    fn table() {
        let layers = vec![
            LayerInfo::new("input_0".into(), "InputLayer".into(), vec![1, 3, 8, 8], 0, 0),
            LayerInfo::new("LAYER_0".into(), "Conv2D".into(), vec![1, 4, 8, 8], 112, 0),
            LayerInfo::new("LAYER_1".into(), "BatchNormalization".into(), vec![1, 4, 8, 8], 8, 8),
        ];
        let table = render(&layers);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(
            lines[1].trim_end(),
            "Layer (type)                 Output Shape              Param #"
        );
        assert_eq!(lines[3].trim_end(), "input_0 (InputLayer)         (None, 3, 8, 8)           0");
        assert!(lines[7].starts_with("LAYER_1 (BatchNormalization) (None, 4, 8, 8)"));
        assert_eq!(lines[8], "=".repeat(65));
        assert_eq!(lines[9], "Total params: 128");
        assert_eq!(lines[10], "Trainable params: 120");
        assert_eq!(lines[11], "Non-trainable params: 8");
        assert!(lines.iter().all(|l| l.len() <= 65));
    }
}
