//! Conservatory documents for tests.
//!
//! Document shapes follow the collections the cascade registry knows about:
//! students, teachers with nested time blocks, orchestras, attendance,
//! rehearsals, theory lessons and bagrut (matriculation exam) records.

use serde_json::{Value, json};

use crate::id::EntityId;
use crate::store::{Collections, Document, StoreResult};

pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("fixture must be a JSON object, got {other}"),
    }
}

pub fn student(id: &EntityId, name: &str) -> Document {
    doc(json!({
        "_id": id,
        "personalInfo": { "fullName": name },
        "isActive": true,
        "enrollments": { "orchestraIds": [] },
        "teacherAssignments": []
    }))
}

/// Teacher with one time block per `(block_id, day, students)` entry.
pub fn teacher(id: &EntityId, name: &str, blocks: &[(&EntityId, &str, &[&EntityId])]) -> Document {
    let time_blocks: Vec<Value> = blocks
        .iter()
        .map(|(block_id, day, students)| {
            json!({
                "_id": block_id,
                "day": day,
                "startTime": "14:00",
                "endTime": "18:00",
                "assignedLessons": students
                    .iter()
                    .map(|s| json!({ "studentId": s, "lessonStartTime": "14:00", "duration": 45 }))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    doc(json!({
        "_id": id,
        "personalInfo": { "fullName": name },
        "isActive": true,
        "teaching": { "timeBlocks": time_blocks }
    }))
}

pub fn orchestra(id: &EntityId, name: &str, members: &[&EntityId], conductor: Option<&EntityId>) -> Document {
    doc(json!({
        "_id": id,
        "name": name,
        "memberIds": members,
        "conductorId": conductor,
        "isActive": true
    }))
}

pub fn attendance(id: &EntityId, student: &EntityId, activity: &str) -> Document {
    doc(json!({
        "_id": id,
        "studentId": student,
        "activityType": activity,
        "date": "2024-03-01T17:00:00Z",
        "status": "present"
    }))
}

pub fn bagrut(id: &EntityId, student: &EntityId) -> Document {
    doc(json!({
        "_id": id,
        "studentId": student,
        "isActive": true,
        "program": "performance",
        "finalGrade": 95
    }))
}

pub fn rehearsal(id: &EntityId, group: &EntityId) -> Document {
    doc(json!({
        "_id": id,
        "groupId": group,
        "date": "2024-03-04T16:00:00Z",
        "location": "Hall A"
    }))
}

pub fn theory_lesson(id: &EntityId, teacher: &EntityId) -> Document {
    doc(json!({
        "_id": id,
        "teacherId": teacher,
        "category": "solfege",
        "date": "2024-03-05T15:00:00Z"
    }))
}

/// Ids of the documents seeded by [`seed_student_scenario`].
#[derive(Debug, Clone)]
pub struct StudentScenario {
    pub student: EntityId,
    pub teacher: EntityId,
    pub orchestras: [EntityId; 2],
    pub attendance: [EntityId; 3],
    pub bagrut: EntityId,
    /// A second student sharing the orchestras, left untouched by deletion
    pub bystander: EntityId,
}

/// Seed a student referenced by two orchestra memberships, three attendance
/// records and one bagrut record. The student's teacher has a time block
/// that only holds the bystander.
pub async fn seed_student_scenario<C: Collections + ?Sized>(store: &C) -> StoreResult<StudentScenario> {
    let scenario = StudentScenario {
        student: EntityId::generate(),
        teacher: EntityId::generate(),
        orchestras: [EntityId::generate(), EntityId::generate()],
        attendance: [EntityId::generate(), EntityId::generate(), EntityId::generate()],
        bagrut: EntityId::generate(),
        bystander: EntityId::generate(),
    };

    let mut student_doc = student(&scenario.student, "Noa Levi");
    student_doc.insert(
        "enrollments".to_string(),
        json!({ "orchestraIds": &scenario.orchestras }),
    );
    store.insert_one("student", student_doc).await?;
    let mut bystander_doc = student(&scenario.bystander, "Amit Cohen");
    bystander_doc.insert(
        "enrollments".to_string(),
        json!({ "orchestraIds": &scenario.orchestras }),
    );
    store.insert_one("student", bystander_doc).await?;

    let block = EntityId::generate();
    store
        .insert_one(
            "teacher",
            teacher(
                &scenario.teacher,
                "Miriam Katz",
                &[(&block, "Sunday", &[&scenario.bystander][..])],
            ),
        )
        .await?;

    for (i, orchestra_id) in scenario.orchestras.iter().enumerate() {
        store
            .insert_one(
                "orchestra",
                orchestra(
                    orchestra_id,
                    &format!("Orchestra {}", i + 1),
                    &[&scenario.student, &scenario.bystander],
                    Some(&scenario.teacher),
                ),
            )
            .await?;
    }

    for id in &scenario.attendance {
        store
            .insert_one("activity_attendance", attendance(id, &scenario.student, "rehearsal"))
            .await?;
    }

    store
        .insert_one("bagrut", bagrut(&scenario.bagrut, &scenario.student))
        .await?;

    Ok(scenario)
}
